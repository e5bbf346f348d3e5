use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{GatewayStore, ReplaceError, ReplaceOutcome, StoreError, check_column_limits};
use crate::types::{
    AdminAccount, ClientFields, ClientRecord, CredentialRow, DestinationRow, MasterRow,
    NewSyncLogEntry, SyncLogEntry,
};

#[derive(Default)]
pub(super) struct MemoryGatewayStore {
    inner: Mutex<MemoryGatewayInner>,
}

#[derive(Default)]
struct MemoryGatewayInner {
    clients: HashMap<String, ClientRecord>,
    master_rows: HashMap<String, Vec<MasterRow>>,
    credential_rows: HashMap<String, Vec<CredentialRow>>,
    logs: Vec<SyncLogEntry>,
    next_log_id: i64,
    admins: HashMap<String, AdminAccount>,
}

#[async_trait]
impl GatewayStore for MemoryGatewayStore {
    async fn insert_client(&self, record: ClientRecord) -> Result<ClientRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.clients.contains_key(&record.client_id) {
            return Err(StoreError::Conflict(format!(
                "client id {} already exists",
                record.client_id
            )));
        }
        inner
            .clients
            .insert(record.client_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_client(
        &self,
        client_id: &str,
        fields: ClientFields,
        access_token: String,
        updated_at: DateTime<Utc>,
    ) -> Result<ClientRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| StoreError::NotFound(format!("client {client_id}")))?;
        record.fields = fields;
        record.access_token = access_token;
        record.updated_at = updated_at;
        Ok(record.clone())
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains_key(client_id) {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }
        inner.credential_rows.remove(client_id);
        inner.master_rows.remove(client_id);
        inner.logs.retain(|entry| entry.client_id != client_id);
        inner.clients.remove(client_id);
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.clients.get(client_id).cloned())
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut clients = inner.clients.values().cloned().collect::<Vec<_>>();
        clients.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| left.client_id.cmp(&right.client_id))
        });
        Ok(clients)
    }

    async fn authenticate_client(
        &self,
        client_id: &str,
        access_token: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .clients
            .get(client_id)
            .is_some_and(|record| record.access_token == access_token))
    }

    async fn replace_destination_rows(
        &self,
        client_id: &str,
        access_token: &str,
        rows: Vec<DestinationRow>,
    ) -> Result<ReplaceOutcome, ReplaceError> {
        let mut inner = self.inner.lock().await;
        let authenticated = inner
            .clients
            .get(client_id)
            .is_some_and(|record| record.access_token == access_token);
        if !authenticated {
            return Err(ReplaceError::Unauthorized);
        }

        // The guard is held for the whole batch, so readers never observe the
        // purged-but-not-refilled state.
        let mut masters = Vec::new();
        let mut credentials = Vec::new();
        let mut codes = HashSet::new();
        let mut user_ids = HashSet::new();
        let mut outcome = ReplaceOutcome::default();

        for row in rows {
            let result = check_column_limits(&row).and_then(|()| match row {
                DestinationRow::Credential(credential) => {
                    if !user_ids.insert(credential.user_id.clone()) {
                        return Err(format!(
                            "duplicate key value violates unique constraint (client_id, user_id)=({client_id}, {})",
                            credential.user_id
                        ));
                    }
                    credentials.push(credential);
                    Ok(())
                }
                DestinationRow::Master(master) => {
                    if !codes.insert(master.code.clone()) {
                        return Err(format!(
                            "duplicate key value violates unique constraint (client_id, code)=({client_id}, {})",
                            master.code
                        ));
                    }
                    masters.push(master);
                    Ok(())
                }
            });
            outcome.rows.push(result);
        }

        inner.master_rows.insert(client_id.to_string(), masters);
        inner
            .credential_rows
            .insert(client_id.to_string(), credentials);
        Ok(outcome)
    }

    async fn master_rows(&self, client_id: &str) -> Result<Vec<MasterRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.master_rows.get(client_id).cloned().unwrap_or_default())
    }

    async fn credential_rows(&self, client_id: &str) -> Result<Vec<CredentialRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .credential_rows
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, entry: NewSyncLogEntry) -> Result<SyncLogEntry, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains_key(&entry.client_id) {
            return Err(StoreError::NotFound(format!("client {}", entry.client_id)));
        }
        inner.next_log_id += 1;
        let stored = SyncLogEntry {
            id: inner.next_log_id,
            client_id: entry.client_id,
            logged_at: Utc::now(),
            record_count: entry.record_count,
            status: entry.status,
            message: entry.message,
        };
        inner.logs.push(stored.clone());
        Ok(stored)
    }

    async fn list_logs(
        &self,
        client_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|entry| client_id.is_none_or(|wanted| entry.client_id == wanted))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_admin(&self, admin: AdminAccount) -> Result<AdminAccount, StoreError> {
        let mut inner = self.inner.lock().await;
        let existing_id = inner
            .admins
            .values()
            .find(|existing| existing.username == admin.username)
            .map(|existing| existing.admin_id.clone());
        let stored = match existing_id {
            Some(admin_id) => AdminAccount { admin_id, ..admin },
            None => admin,
        };
        inner
            .admins
            .insert(stored.admin_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn admin_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AdminAccount>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .admins
            .values()
            .find(|admin| admin.username == username)
            .cloned())
    }

    async fn admin_by_id(&self, admin_id: &str) -> Result<Option<AdminAccount>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.admins.get(admin_id).cloned())
    }

    async fn set_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let admin = inner
            .admins
            .get_mut(admin_id)
            .ok_or_else(|| StoreError::NotFound(format!("admin {admin_id}")))?;
        admin.current_session_sha256 = Some(session_sha256.to_string());
        Ok(())
    }

    async fn clear_admin_session(
        &self,
        admin_id: &str,
        session_sha256: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(admin) = inner.admins.get_mut(admin_id) else {
            return Ok(false);
        };
        if admin.current_session_sha256.as_deref() != Some(session_sha256) {
            return Ok(false);
        }
        admin.current_session_sha256 = None;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::store::{GatewayStore, ReplaceError, StoreError, memory};
    use crate::types::{
        ClientFields, ClientRecord, CredentialRow, DestinationRow, MasterRow, NewSyncLogEntry,
        SyncStatus,
    };

    fn record(client_id: &str, token: &str) -> ClientRecord {
        let now = Utc::now();
        ClientRecord {
            client_id: client_id.to_string(),
            access_token: token.to_string(),
            fields: ClientFields::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn master(code: &str) -> DestinationRow {
        DestinationRow::Master(MasterRow {
            code: code.to_string(),
            name: None,
            address: None,
            place: None,
            super_code: None,
        })
    }

    #[tokio::test]
    async fn insert_client_never_overwrites_existing_id() {
        let store = memory();
        store
            .insert_client(record("0000000001", "a"))
            .await
            .expect("first insert");
        let error = store
            .insert_client(record("0000000001", "b"))
            .await
            .expect_err("duplicate id");
        assert!(matches!(error, StoreError::Conflict(_)));
        let kept = store
            .get_client("0000000001")
            .await
            .expect("lookup")
            .expect("client present");
        assert_eq!(kept.access_token, "a");
    }

    #[tokio::test]
    async fn replace_rejects_wrong_token_without_touching_rows() {
        let store = memory();
        store
            .insert_client(record("0000000001", "token"))
            .await
            .expect("insert");
        store
            .replace_destination_rows("0000000001", "token", vec![master("C1")])
            .await
            .expect("first replace");

        let error = store
            .replace_destination_rows("0000000001", "wrong", vec![])
            .await
            .expect_err("wrong token");
        assert!(matches!(error, ReplaceError::Unauthorized));
        assert_eq!(store.master_rows("0000000001").await.expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn replace_reports_duplicates_per_row() {
        let store = memory();
        store
            .insert_client(record("0000000001", "token"))
            .await
            .expect("insert");
        let outcome = store
            .replace_destination_rows(
                "0000000001",
                "token",
                vec![
                    master("C1"),
                    master("C1"),
                    DestinationRow::Credential(CredentialRow {
                        user_id: "u1".to_string(),
                        pass: "p".to_string(),
                    }),
                ],
            )
            .await
            .expect("replace");
        assert_eq!(outcome.inserted(), 2);
        assert!(outcome.rows[1].is_err());
    }

    #[tokio::test]
    async fn list_clients_is_newest_first_and_logs_are_filtered() {
        let store = memory();
        let mut older = record("0000000001", "a");
        older.created_at = Utc::now() - Duration::minutes(5);
        store.insert_client(older).await.expect("older");
        store
            .insert_client(record("0000000002", "b"))
            .await
            .expect("newer");
        let ids = store
            .list_clients()
            .await
            .expect("list")
            .into_iter()
            .map(|client| client.client_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["0000000002", "0000000001"]);

        for client_id in ["0000000001", "0000000002", "0000000001"] {
            store
                .append_log(NewSyncLogEntry {
                    client_id: client_id.to_string(),
                    record_count: 1,
                    status: SyncStatus::Success,
                    message: String::new(),
                })
                .await
                .expect("append");
        }
        let logs = store
            .list_logs(Some("0000000001"), 10)
            .await
            .expect("logs");
        assert_eq!(logs.len(), 2);
        assert!(logs[0].id > logs[1].id);
        assert_eq!(store.list_logs(None, 1).await.expect("logs").len(), 1);
    }
}
