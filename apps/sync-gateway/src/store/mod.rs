use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::GatewayDb;
use crate::types::{
    AdminAccount, ClientFields, ClientRecord, CredentialRow, DestinationRow, MasterRow,
    NewSyncLogEntry, SyncLogEntry, MAX_KEY_CHARS, MAX_TEXT_CHARS,
};

mod memory;
mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Failure of the transactional replace. Row-level failures are not errors;
/// they come back inside [`ReplaceOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum ReplaceError {
    #[error("client id and access token do not match")]
    Unauthorized,
    #[error("storage fault (authenticated: {authenticated}): {message}")]
    Storage { authenticated: bool, message: String },
}

/// Per-row insert results, index-aligned with the rows handed to
/// [`GatewayStore::replace_destination_rows`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub rows: Vec<Result<(), String>>,
}

impl ReplaceOutcome {
    #[must_use]
    pub fn inserted(&self) -> usize {
        self.rows.iter().filter(|row| row.is_ok()).count()
    }
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Inserts a new client. Fails with `Conflict` when the id is taken.
    async fn insert_client(&self, record: ClientRecord) -> Result<ClientRecord, StoreError>;

    async fn update_client(
        &self,
        client_id: &str,
        fields: ClientFields,
        access_token: String,
        updated_at: DateTime<Utc>,
    ) -> Result<ClientRecord, StoreError>;

    /// Removes credential rows, master rows, log entries and the client in one
    /// unit.
    async fn delete_client(&self, client_id: &str) -> Result<(), StoreError>;

    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError>;

    /// Newest first.
    async fn list_clients(&self) -> Result<Vec<ClientRecord>, StoreError>;

    async fn authenticate_client(
        &self,
        client_id: &str,
        access_token: &str,
    ) -> Result<bool, StoreError>;

    /// Authenticates, purges both destination tables for the client and
    /// inserts `rows` in order, all inside one transaction.
    async fn replace_destination_rows(
        &self,
        client_id: &str,
        access_token: &str,
        rows: Vec<DestinationRow>,
    ) -> Result<ReplaceOutcome, ReplaceError>;

    async fn master_rows(&self, client_id: &str) -> Result<Vec<MasterRow>, StoreError>;

    async fn credential_rows(&self, client_id: &str) -> Result<Vec<CredentialRow>, StoreError>;

    async fn append_log(&self, entry: NewSyncLogEntry) -> Result<SyncLogEntry, StoreError>;

    /// Newest first.
    async fn list_logs(
        &self,
        client_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StoreError>;

    async fn upsert_admin(&self, admin: AdminAccount) -> Result<AdminAccount, StoreError>;

    async fn admin_by_username(&self, username: &str)
    -> Result<Option<AdminAccount>, StoreError>;

    async fn admin_by_id(&self, admin_id: &str) -> Result<Option<AdminAccount>, StoreError>;

    async fn set_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<(), StoreError>;

    /// Clears the admin's session reference only if it still equals
    /// `session_sha256`. Returns whether anything was cleared.
    async fn clear_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub fn memory() -> Arc<dyn GatewayStore> {
    Arc::new(memory::MemoryGatewayStore::default())
}

pub fn postgres(db: Arc<GatewayDb>) -> Arc<dyn GatewayStore> {
    Arc::new(postgres::PostgresGatewayStore::new(db))
}

/// Column checks shared by both stores: character widths, and no NUL, which
/// PostgreSQL text columns cannot hold.
pub(crate) fn check_column_limits(row: &DestinationRow) -> Result<(), String> {
    match row {
        DestinationRow::Credential(credential) => {
            check_width("user_id", &credential.user_id, MAX_KEY_CHARS)?;
            check_width("pass", &credential.pass, MAX_TEXT_CHARS)
        }
        DestinationRow::Master(master) => {
            check_width("code", &master.code, MAX_KEY_CHARS)?;
            for (column, value) in [
                ("name", &master.name),
                ("address", &master.address),
                ("place", &master.place),
                ("super_code", &master.super_code),
            ] {
                if let Some(value) = value {
                    check_width(column, value, MAX_TEXT_CHARS)?;
                }
            }
            Ok(())
        }
    }
}

fn check_width(column: &str, value: &str, max: usize) -> Result<(), String> {
    if value.contains('\0') {
        return Err(format!("value for column {column} contains a NUL character"));
    }
    let length = value.chars().count();
    if length > max {
        return Err(format!(
            "value too long for column {column} ({length} > {max} characters)"
        ));
    }
    Ok(())
}
