use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CLIENT_ID_DIGITS: usize = 10;
pub const ACCESS_TOKEN_HEX_LEN: usize = 64;

pub const MAX_KEY_CHARS: usize = 64;
pub const MAX_TEXT_CHARS: usize = 255;

/// Full client record as persisted. Never serialized to API callers directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub access_token: String,
    pub fields: ClientFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrator-supplied client attributes. Every field is required on both
/// create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFields {
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub client_id: String,
    pub db_name: String,
    pub db_user: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ClientRecord> for ClientSummary {
    fn from(record: &ClientRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            db_name: record.fields.db_name.clone(),
            db_user: record.fields.db_user.clone(),
            name: record.fields.name.clone(),
            address: record.fields.address.clone(),
            phone: record.fields.phone.clone(),
            username: record.fields.username.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigBundle {
    pub client_id: String,
    pub db_name: String,
    pub access_token: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredentials {
    pub client_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRow {
    pub code: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub place: Option<String>,
    pub super_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRow {
    pub user_id: String,
    pub pass: String,
}

/// A destination row ready for insertion, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationRow {
    Credential(CredentialRow),
    Master(MasterRow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "PARTIAL" => Ok(Self::Partial),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown sync status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncLogEntry {
    pub client_id: String,
    pub record_count: u64,
    pub status: SyncStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub client_id: String,
    pub logged_at: DateTime<Utc>,
    pub record_count: u64,
    pub status: SyncStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub admin_id: String,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub current_session_sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::SyncStatus;

    #[test]
    fn sync_status_parses_case_insensitively() {
        assert_eq!("success".parse::<SyncStatus>(), Ok(SyncStatus::Success));
        assert_eq!(" Partial ".parse::<SyncStatus>(), Ok(SyncStatus::Partial));
        assert_eq!("FAILED".parse::<SyncStatus>(), Ok(SyncStatus::Failed));
        assert!("done".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn sync_status_serializes_uppercase() {
        let encoded = serde_json::to_string(&SyncStatus::Partial).expect("encode status");
        assert_eq!(encoded, "\"PARTIAL\"");
    }
}
