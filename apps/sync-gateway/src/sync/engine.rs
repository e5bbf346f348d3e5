use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditLog;
use crate::store::{GatewayStore, ReplaceError};
use crate::sync::rows::{ClassifiedRow, SkipReason, classify_row};
use crate::types::{NewSyncLogEntry, SyncLogEntry, SyncStatus};

const AUDIT_TARGET: &str = "sync_gateway::audit";
const FAILED_MESSAGE: &str = "Sync failed: internal error";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("client id and access token do not match")]
    Unauthorized,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Body of a bulk upload. Every field is optional at the wire level so that
/// shape problems surface as `BadRequest` rather than a decoder rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpload {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReport {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub index: usize,
    pub row: Value,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub success: bool,
    pub message: String,
    pub record_count: u64,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RowError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedRow>,
}

/// Runs bulk-replace uploads and standalone log reports for sync clients.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn GatewayStore>,
    audit: AuditLog,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn GatewayStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn sync_data(&self, upload: SyncUpload) -> Result<SyncSummary, SyncError> {
        let client_id = required_text(upload.client_id, "clientId")?;
        let access_token = required_text(upload.access_token, "accessToken")?;
        let raw_rows = match upload.data {
            Some(Value::Array(rows)) => rows,
            Some(_) => {
                return Err(SyncError::BadRequest("data must be an array".to_string()));
            }
            None => return Err(SyncError::BadRequest("data is required".to_string())),
        };

        // Classification is pure, so it runs before the transaction opens.
        // `positions[n]` is the input index of the n-th destination row.
        let mut destination = Vec::with_capacity(raw_rows.len());
        let mut positions = Vec::with_capacity(raw_rows.len());
        let mut skipped = Vec::new();
        for (index, raw) in raw_rows.iter().enumerate() {
            match classify_row(raw) {
                ClassifiedRow::Skipped(reason) => skipped.push(SkippedRow { index, reason }),
                classified => {
                    if let Some(row) = classified.into_destination() {
                        destination.push(row);
                        positions.push(index);
                    }
                }
            }
        }

        let outcome = match self
            .store
            .replace_destination_rows(&client_id, &access_token, destination)
            .await
        {
            Ok(outcome) => outcome,
            Err(ReplaceError::Unauthorized) => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    client_id = %client_id,
                    reason = "client id and access token do not match",
                    "sync upload rejected"
                );
                return Err(SyncError::Unauthorized);
            }
            Err(ReplaceError::Storage {
                authenticated,
                message,
            }) => {
                tracing::error!(
                    client_id = %client_id,
                    authenticated,
                    reason = %message,
                    "sync transaction rolled back"
                );
                if authenticated {
                    self.append_best_effort(NewSyncLogEntry {
                        client_id: client_id.clone(),
                        record_count: 0,
                        status: SyncStatus::Failed,
                        message: FAILED_MESSAGE.to_string(),
                    })
                    .await;
                }
                return Err(SyncError::Internal(message));
            }
        };

        let record_count = u64::try_from(outcome.inserted()).unwrap_or(u64::MAX);
        let mut errors = Vec::new();
        for (position, result) in outcome.rows.into_iter().enumerate() {
            if let Err(error) = result {
                let index = positions.get(position).copied().unwrap_or(position);
                errors.push(RowError {
                    index,
                    row: raw_rows.get(index).cloned().unwrap_or(Value::Null),
                    error,
                });
            }
        }
        let (status, message) = if errors.is_empty() {
            (SyncStatus::Success, "Sync completed successfully".to_string())
        } else {
            (
                SyncStatus::Partial,
                format!("Sync completed with {} error(s)", errors.len()),
            )
        };

        tracing::info!(
            client_id = %client_id,
            record_count,
            status = %status,
            errors = errors.len(),
            skipped = skipped.len(),
            "sync upload applied"
        );
        self.append_best_effort(NewSyncLogEntry {
            client_id,
            record_count,
            status,
            message: message.clone(),
        })
        .await;

        Ok(SyncSummary {
            success: true,
            message,
            record_count,
            status,
            errors,
            skipped,
        })
    }

    pub async fn record_log(&self, report: LogReport) -> Result<SyncLogEntry, SyncError> {
        let client_id = required_text(report.client_id, "clientId")?;
        let access_token = required_text(report.access_token, "accessToken")?;
        let status = required_text(report.status, "status")?
            .parse::<SyncStatus>()
            .map_err(SyncError::BadRequest)?;
        let record_count = report.record_count.unwrap_or(0);
        if i64::try_from(record_count).is_err() {
            return Err(SyncError::BadRequest(format!(
                "recordCount must not exceed {}",
                i64::MAX
            )));
        }

        let authenticated = self
            .store
            .authenticate_client(&client_id, &access_token)
            .await
            .map_err(|error| SyncError::Internal(error.to_string()))?;
        if !authenticated {
            tracing::warn!(
                target: AUDIT_TARGET,
                client_id = %client_id,
                reason = "client id and access token do not match",
                "sync log report rejected"
            );
            return Err(SyncError::Unauthorized);
        }

        self.audit
            .append(NewSyncLogEntry {
                client_id,
                record_count,
                status,
                message: report.message.unwrap_or_default(),
            })
            .await
            .map_err(|error| SyncError::Internal(error.to_string()))
    }

    async fn append_best_effort(&self, entry: NewSyncLogEntry) {
        let client_id = entry.client_id.clone();
        if let Err(error) = self.audit.append(entry).await {
            tracing::error!(
                target: AUDIT_TARGET,
                client_id = %client_id,
                reason = %error,
                "failed to append sync log entry"
            );
        }
    }
}

fn required_text(value: Option<String>, field: &str) -> Result<String, SyncError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SyncError::BadRequest(format!("{field} is required")))
}
