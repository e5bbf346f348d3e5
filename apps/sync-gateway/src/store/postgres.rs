use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;

use super::{GatewayStore, ReplaceError, ReplaceOutcome, StoreError, check_column_limits};
use crate::db::GatewayDb;
use crate::types::{
    AdminAccount, ClientFields, ClientRecord, CredentialRow, DestinationRow, MasterRow,
    NewSyncLogEntry, SyncLogEntry, SyncStatus,
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

pub(super) struct PostgresGatewayStore {
    db: Arc<GatewayDb>,
}

impl PostgresGatewayStore {
    pub(super) fn new(db: Arc<GatewayDb>) -> Self {
        Self { db }
    }
}

fn db_error(error: &tokio_postgres::Error) -> StoreError {
    StoreError::Db(error.to_string())
}

fn pool_error(error: PoolError) -> StoreError {
    StoreError::Db(format!("postgres pool: {error}"))
}

fn sql_state(error: &tokio_postgres::Error) -> Option<&str> {
    error.code().map(|state| state.code())
}

/// Human-readable message for a row-level failure. Prefers the server's own
/// message over the driver's generic wrapper.
fn row_error_message(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db_error) => match db_error.detail() {
            Some(detail) => format!("{}: {detail}", db_error.message()),
            None => db_error.message().to_string(),
        },
        None => error.to_string(),
    }
}

#[async_trait]
impl GatewayStore for PostgresGatewayStore {
    async fn insert_client(&self, record: ClientRecord) -> Result<ClientRecord, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let inserted = client
            .query_opt(
                r#"
                INSERT INTO sync_gateway.clients (
                  client_id,
                  access_token,
                  db_name,
                  db_user,
                  db_password,
                  name,
                  address,
                  phone,
                  username,
                  password,
                  created_at,
                  updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                ON CONFLICT (client_id) DO NOTHING
                RETURNING client_id
                "#,
                &[
                    &record.client_id,
                    &record.access_token,
                    &record.fields.db_name,
                    &record.fields.db_user,
                    &record.fields.db_password,
                    &record.fields.name,
                    &record.fields.address,
                    &record.fields.phone,
                    &record.fields.username,
                    &record.fields.password,
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(|error| db_error(&error))?;

        if inserted.is_none() {
            return Err(StoreError::Conflict(format!(
                "client id {} already exists",
                record.client_id
            )));
        }
        Ok(record)
    }

    async fn update_client(
        &self,
        client_id: &str,
        fields: ClientFields,
        access_token: String,
        updated_at: DateTime<Utc>,
    ) -> Result<ClientRecord, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_opt(
                r#"
                UPDATE sync_gateway.clients
                   SET access_token = $2,
                       db_name = $3,
                       db_user = $4,
                       db_password = $5,
                       name = $6,
                       address = $7,
                       phone = $8,
                       username = $9,
                       password = $10,
                       updated_at = $11
                 WHERE client_id = $1
             RETURNING client_id, access_token, db_name, db_user, db_password, name,
                       address, phone, username, password, created_at, updated_at
                "#,
                &[
                    &client_id,
                    &access_token,
                    &fields.db_name,
                    &fields.db_user,
                    &fields.db_password,
                    &fields.name,
                    &fields.address,
                    &fields.phone,
                    &fields.username,
                    &fields.password,
                    &updated_at,
                ],
            )
            .await
            .map_err(|error| db_error(&error))?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        };
        Ok(map_client_row(&row))
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        let mut client = self.db.client().await.map_err(pool_error)?;
        let tx = client
            .transaction()
            .await
            .map_err(|error| db_error(&error))?;

        for statement in [
            "DELETE FROM sync_gateway.credential_rows WHERE client_id = $1",
            "DELETE FROM sync_gateway.master_rows WHERE client_id = $1",
            "DELETE FROM sync_gateway.sync_logs WHERE client_id = $1",
        ] {
            tx.execute(statement, &[&client_id])
                .await
                .map_err(|error| db_error(&error))?;
        }
        let removed = tx
            .execute(
                "DELETE FROM sync_gateway.clients WHERE client_id = $1",
                &[&client_id],
            )
            .await
            .map_err(|error| db_error(&error))?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }

        tx.commit().await.map_err(|error| db_error(&error))?;
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_opt(
                r#"
                SELECT client_id, access_token, db_name, db_user, db_password, name,
                       address, phone, username, password, created_at, updated_at
                  FROM sync_gateway.clients
                 WHERE client_id = $1
                "#,
                &[&client_id],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(row.as_ref().map(map_client_row))
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let rows = client
            .query(
                r#"
                SELECT client_id, access_token, db_name, db_user, db_password, name,
                       address, phone, username, password, created_at, updated_at
                  FROM sync_gateway.clients
                 ORDER BY created_at DESC, client_id ASC
                "#,
                &[],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(rows.iter().map(map_client_row).collect())
    }

    async fn authenticate_client(
        &self,
        client_id: &str,
        access_token: &str,
    ) -> Result<bool, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_opt(
                r#"
                SELECT 1
                  FROM sync_gateway.clients
                 WHERE client_id = $1 AND access_token = $2
                "#,
                &[&client_id, &access_token],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(row.is_some())
    }

    async fn replace_destination_rows(
        &self,
        client_id: &str,
        access_token: &str,
        rows: Vec<DestinationRow>,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let before_auth = |error: tokio_postgres::Error| ReplaceError::Storage {
            authenticated: false,
            message: error.to_string(),
        };
        let after_auth = |error: tokio_postgres::Error| ReplaceError::Storage {
            authenticated: true,
            message: error.to_string(),
        };

        let mut client = self.db.client().await.map_err(|error| ReplaceError::Storage {
            authenticated: false,
            message: error.to_string(),
        })?;
        // Dropping `tx` without commit rolls back, which covers both early
        // returns and a cancelled request future.
        let mut tx = client.transaction().await.map_err(before_auth)?;

        let matched = tx
            .query_opt(
                r#"
                SELECT client_id
                  FROM sync_gateway.clients
                 WHERE client_id = $1 AND access_token = $2
                 FOR UPDATE
                "#,
                &[&client_id, &access_token],
            )
            .await
            .map_err(before_auth)?;
        if matched.is_none() {
            return Err(ReplaceError::Unauthorized);
        }

        tx.execute(
            "DELETE FROM sync_gateway.credential_rows WHERE client_id = $1",
            &[&client_id],
        )
        .await
        .map_err(after_auth)?;
        tx.execute(
            "DELETE FROM sync_gateway.master_rows WHERE client_id = $1",
            &[&client_id],
        )
        .await
        .map_err(after_auth)?;

        let mut outcome = ReplaceOutcome::default();
        for row in rows {
            if let Err(message) = check_column_limits(&row) {
                outcome.rows.push(Err(message));
                continue;
            }

            let savepoint = tx.savepoint("sync_row").await.map_err(after_auth)?;
            let inserted = match &row {
                DestinationRow::Credential(credential) => {
                    savepoint
                        .execute(
                            r#"
                            INSERT INTO sync_gateway.credential_rows (client_id, user_id, pass)
                            VALUES ($1, $2, $3)
                            "#,
                            &[&client_id, &credential.user_id, &credential.pass],
                        )
                        .await
                }
                DestinationRow::Master(master) => {
                    savepoint
                        .execute(
                            r#"
                            INSERT INTO sync_gateway.master_rows (
                              client_id, code, name, address, place, super_code
                            )
                            VALUES ($1, $2, $3, $4, $5, $6)
                            "#,
                            &[
                                &client_id,
                                &master.code,
                                &master.name,
                                &master.address,
                                &master.place,
                                &master.super_code,
                            ],
                        )
                        .await
                }
            };

            match inserted {
                Ok(_) => {
                    savepoint.commit().await.map_err(after_auth)?;
                    outcome.rows.push(Ok(()));
                }
                Err(error) if error.as_db_error().is_some() => {
                    savepoint.rollback().await.map_err(after_auth)?;
                    outcome.rows.push(Err(row_error_message(&error)));
                }
                Err(error) => return Err(after_auth(error)),
            }
        }

        tx.commit().await.map_err(after_auth)?;
        Ok(outcome)
    }

    async fn master_rows(&self, client_id: &str) -> Result<Vec<MasterRow>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let rows = client
            .query(
                r#"
                SELECT code, name, address, place, super_code
                  FROM sync_gateway.master_rows
                 WHERE client_id = $1
                 ORDER BY code
                "#,
                &[&client_id],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(rows
            .iter()
            .map(|row| MasterRow {
                code: row.get("code"),
                name: row.get("name"),
                address: row.get("address"),
                place: row.get("place"),
                super_code: row.get("super_code"),
            })
            .collect())
    }

    async fn credential_rows(&self, client_id: &str) -> Result<Vec<CredentialRow>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let rows = client
            .query(
                r#"
                SELECT user_id, pass
                  FROM sync_gateway.credential_rows
                 WHERE client_id = $1
                 ORDER BY user_id
                "#,
                &[&client_id],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(rows
            .iter()
            .map(|row| CredentialRow {
                user_id: row.get("user_id"),
                pass: row.get("pass"),
            })
            .collect())
    }

    async fn append_log(&self, entry: NewSyncLogEntry) -> Result<SyncLogEntry, StoreError> {
        let record_count = i64::try_from(entry.record_count).map_err(|_| {
            StoreError::Db(format!("record_count {} out of range", entry.record_count))
        })?;
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_one(
                r#"
                INSERT INTO sync_gateway.sync_logs (client_id, record_count, status, message)
                VALUES ($1, $2, $3, $4)
                RETURNING id, client_id, logged_at, record_count, status, message
                "#,
                &[
                    &entry.client_id,
                    &record_count,
                    &entry.status.as_str(),
                    &entry.message,
                ],
            )
            .await
            .map_err(|error| {
                if sql_state(&error) == Some(FOREIGN_KEY_VIOLATION) {
                    StoreError::NotFound(format!("client {}", entry.client_id))
                } else {
                    db_error(&error)
                }
            })?;
        map_log_row(&row).map_err(StoreError::Db)
    }

    async fn list_logs(
        &self,
        client_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client().await.map_err(pool_error)?;
        let rows = client
            .query(
                r#"
                SELECT id, client_id, logged_at, record_count, status, message
                  FROM sync_gateway.sync_logs
                 WHERE ($1::text IS NULL OR client_id = $1)
                 ORDER BY id DESC
                 LIMIT $2
                "#,
                &[&client_id, &limit],
            )
            .await
            .map_err(|error| db_error(&error))?;
        rows.iter()
            .map(|row| map_log_row(row).map_err(StoreError::Db))
            .collect()
    }

    async fn upsert_admin(&self, admin: AdminAccount) -> Result<AdminAccount, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_one(
                r#"
                INSERT INTO sync_gateway.admins (
                  admin_id, username, password_hash, salt, current_session_sha256
                )
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (username) DO UPDATE
                   SET password_hash = EXCLUDED.password_hash,
                       salt = EXCLUDED.salt,
                       current_session_sha256 = EXCLUDED.current_session_sha256
                RETURNING admin_id, username, password_hash, salt, current_session_sha256
                "#,
                &[
                    &admin.admin_id,
                    &admin.username,
                    &admin.password_hash,
                    &admin.salt,
                    &admin.current_session_sha256,
                ],
            )
            .await
            .map_err(|error| {
                if sql_state(&error) == Some(UNIQUE_VIOLATION) {
                    StoreError::Conflict(format!("admin {} already exists", admin.admin_id))
                } else {
                    db_error(&error)
                }
            })?;
        Ok(map_admin_row(&row))
    }

    async fn admin_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AdminAccount>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_opt(
                r#"
                SELECT admin_id, username, password_hash, salt, current_session_sha256
                  FROM sync_gateway.admins
                 WHERE username = $1
                "#,
                &[&username],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(row.as_ref().map(map_admin_row))
    }

    async fn admin_by_id(&self, admin_id: &str) -> Result<Option<AdminAccount>, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let row = client
            .query_opt(
                r#"
                SELECT admin_id, username, password_hash, salt, current_session_sha256
                  FROM sync_gateway.admins
                 WHERE admin_id = $1
                "#,
                &[&admin_id],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(row.as_ref().map(map_admin_row))
    }

    async fn set_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<(), StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let updated = client
            .execute(
                "UPDATE sync_gateway.admins SET current_session_sha256 = $2 WHERE admin_id = $1",
                &[&admin_id, &session_sha256],
            )
            .await
            .map_err(|error| db_error(&error))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("admin {admin_id}")));
        }
        Ok(())
    }

    async fn clear_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<bool, StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        let updated = client
            .execute(
                r#"
                UPDATE sync_gateway.admins
                   SET current_session_sha256 = NULL
                 WHERE admin_id = $1 AND current_session_sha256 = $2
                "#,
                &[&admin_id, &session_sha256],
            )
            .await
            .map_err(|error| db_error(&error))?;
        Ok(updated > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.db.client().await.map_err(pool_error)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|error| db_error(&error))?;
        Ok(())
    }
}

fn map_client_row(row: &tokio_postgres::Row) -> ClientRecord {
    ClientRecord {
        client_id: row.get("client_id"),
        access_token: row.get("access_token"),
        fields: ClientFields {
            db_name: row.get("db_name"),
            db_user: row.get("db_user"),
            db_password: row.get("db_password"),
            name: row.get("name"),
            address: row.get("address"),
            phone: row.get("phone"),
            username: row.get("username"),
            password: row.get("password"),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_log_row(row: &tokio_postgres::Row) -> Result<SyncLogEntry, String> {
    let record_count: i64 = row.get("record_count");
    let status: String = row.get("status");
    Ok(SyncLogEntry {
        id: row.get("id"),
        client_id: row.get("client_id"),
        logged_at: row.get("logged_at"),
        record_count: u64::try_from(record_count)
            .map_err(|_| format!("negative record_count {record_count}"))?,
        status: status.parse::<SyncStatus>()?,
        message: row.get("message"),
    })
}

fn map_admin_row(row: &tokio_postgres::Row) -> AdminAccount {
    AdminAccount {
        admin_id: row.get("admin_id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        salt: row.get("salt"),
        current_session_sha256: row.get("current_session_sha256"),
    }
}
