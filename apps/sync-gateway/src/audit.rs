use std::sync::Arc;

use crate::store::{GatewayStore, StoreError};
use crate::types::{NewSyncLogEntry, SyncLogEntry};

pub const DEFAULT_LOG_LIMIT: usize = 100;
pub const MAX_LOG_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("client not found: {0}")]
    UnknownClient(String),
    #[error("audit storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for AuditError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(message) => Self::UnknownClient(message),
            StoreError::Conflict(message) | StoreError::Db(message) => Self::Storage(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub client_id: Option<String>,
    pub limit: Option<usize>,
}

impl LogFilter {
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT)
    }
}

/// Append-only record of sync outcomes, one entry per completed call.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn GatewayStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, entry: NewSyncLogEntry) -> Result<SyncLogEntry, AuditError> {
        let stored = self.store.append_log(entry).await?;
        tracing::info!(
            target: "sync_gateway::audit",
            log_id = stored.id,
            client_id = %stored.client_id,
            record_count = stored.record_count,
            status = %stored.status,
            "sync log entry appended"
        );
        Ok(stored)
    }

    pub async fn list(&self, filter: &LogFilter) -> Result<Vec<SyncLogEntry>, AuditError> {
        let client_id = filter
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        Ok(self
            .store
            .list_logs(client_id, filter.effective_limit())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{AuditError, AuditLog, LogFilter};
    use crate::store::memory;
    use crate::types::{ClientFields, ClientRecord, NewSyncLogEntry, SyncStatus};

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(LogFilter::default().effective_limit(), 100);
        let zero = LogFilter {
            limit: Some(0),
            ..LogFilter::default()
        };
        assert_eq!(zero.effective_limit(), 1);
        let huge = LogFilter {
            limit: Some(50_000),
            ..LogFilter::default()
        };
        assert_eq!(huge.effective_limit(), 1000);
    }

    #[tokio::test]
    async fn append_requires_a_known_client() -> anyhow::Result<()> {
        let store = memory();
        let audit = AuditLog::new(store.clone());
        let error = audit
            .append(NewSyncLogEntry {
                client_id: "0000000404".to_string(),
                record_count: 0,
                status: SyncStatus::Success,
                message: String::new(),
            })
            .await;
        assert!(matches!(error, Err(AuditError::UnknownClient(_))));

        let now = Utc::now();
        store
            .insert_client(ClientRecord {
                client_id: "0000000001".to_string(),
                access_token: "t".to_string(),
                fields: ClientFields::default(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        audit
            .append(NewSyncLogEntry {
                client_id: "0000000001".to_string(),
                record_count: 3,
                status: SyncStatus::Partial,
                message: "Sync completed with 1 error(s)".to_string(),
            })
            .await?;
        let logs = audit
            .list(&LogFilter {
                client_id: Some(" 0000000001 ".to_string()),
                limit: None,
            })
            .await?;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Partial);
        Ok(())
    }
}
