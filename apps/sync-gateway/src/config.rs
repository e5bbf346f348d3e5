use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

pub const DEFAULT_SESSION_SIGNING_KEY: &str = "dev-session-key";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub db_connections: usize,
    pub session_signing_key: String,
    pub session_ttl_seconds: u64,
    pub session_cookie_secure: bool,
    pub bootstrap_admin: Option<BootstrapAdmin>,
    pub public_api_url: String,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit_per_minute: usize,
    pub login_rate_limit_per_minute: usize,
    /// Key throttles on `X-Forwarded-For` / `X-Real-IP` instead of the peer
    /// address. Only safe behind a proxy that overwrites those headers.
    pub trust_forwarded_for: bool,
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SYNC_GATEWAY_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid SYNC_GATEWAY_DB_CONNECTIONS: {0}")]
    InvalidDbConnections(String),
    #[error("invalid SYNC_GATEWAY_SESSION_SIGNING_KEY: {0}")]
    InvalidSessionSigningKey(String),
    #[error("invalid SYNC_GATEWAY_SESSION_TTL_SECONDS: {0}")]
    InvalidSessionTtlSeconds(String),
    #[error("invalid SYNC_GATEWAY_SESSION_COOKIE_SECURE: {0}")]
    InvalidSessionCookieSecure(String),
    #[error("invalid bootstrap admin: {0}")]
    InvalidBootstrapAdmin(String),
    #[error("invalid SYNC_GATEWAY_TRUST_FORWARDED_FOR: {0}")]
    InvalidTrustForwardedFor(String),
    #[error("invalid rate limit setting: {0}")]
    InvalidRateLimit(String),
    #[error("invalid SYNC_GATEWAY_REQUEST_TIMEOUT_SECONDS: {0}")]
    InvalidRequestTimeoutSeconds(String),
    #[error("invalid SYNC_GATEWAY_MAX_BODY_BYTES: {0}")]
    InvalidMaxBodyBytes(String),
    #[error("invalid SYNC_GATEWAY_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("SYNC_GATEWAY_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .trim()
            .parse()?;
        let service_name =
            lookup("SYNC_GATEWAY_SERVICE_NAME").unwrap_or_else(|| "sync-gateway".to_string());
        let build_sha = lookup("SYNC_GATEWAY_BUILD_SHA").unwrap_or_else(|| "dev".to_string());
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let db_connections = parse_with_lookup(&lookup, "SYNC_GATEWAY_DB_CONNECTIONS", 4, |raw| {
            raw.trim()
                .parse::<usize>()
                .map(|value| value.clamp(1, 64))
                .map_err(|error| ConfigError::InvalidDbConnections(error.to_string()))
        })?;

        let session_signing_key = lookup("SYNC_GATEWAY_SESSION_SIGNING_KEY")
            .unwrap_or_else(|| DEFAULT_SESSION_SIGNING_KEY.to_string());
        if session_signing_key.trim().is_empty() {
            return Err(ConfigError::InvalidSessionSigningKey(
                "signing key cannot be blank".to_string(),
            ));
        }
        let session_ttl_seconds =
            parse_with_lookup(&lookup, "SYNC_GATEWAY_SESSION_TTL_SECONDS", 28_800, |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(|value| value.clamp(60, 604_800))
                    .map_err(|error| ConfigError::InvalidSessionTtlSeconds(error.to_string()))
            })?;
        let session_cookie_secure =
            parse_bool_lookup(&lookup, "SYNC_GATEWAY_SESSION_COOKIE_SECURE", false)
                .map_err(ConfigError::InvalidSessionCookieSecure)?;

        let admin_username = lookup("SYNC_GATEWAY_ADMIN_USERNAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let admin_password = lookup("SYNC_GATEWAY_ADMIN_PASSWORD").filter(|value| !value.is_empty());
        let bootstrap_admin = match (admin_username, admin_password) {
            (Some(username), Some(password)) => Some(BootstrapAdmin { username, password }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::InvalidBootstrapAdmin(
                    "SYNC_GATEWAY_ADMIN_USERNAME set without SYNC_GATEWAY_ADMIN_PASSWORD"
                        .to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidBootstrapAdmin(
                    "SYNC_GATEWAY_ADMIN_PASSWORD set without SYNC_GATEWAY_ADMIN_USERNAME"
                        .to_string(),
                ));
            }
        };

        let public_api_url = lookup("SYNC_GATEWAY_PUBLIC_API_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("http://{bind_addr}"));
        let cors_allowed_origins = lookup("SYNC_GATEWAY_CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(normalize_origin_value)
            .collect::<Vec<_>>();

        let parse_rate = |key: &str, default: usize| -> Result<usize, ConfigError> {
            parse_with_lookup(&lookup, key, default, |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map(|value| value.clamp(1, 100_000))
                    .map_err(|error| ConfigError::InvalidRateLimit(format!("{key}: {error}")))
            })
        };
        let rate_limit_per_minute = parse_rate("SYNC_GATEWAY_RATE_LIMIT_PER_MINUTE", 120)?;
        let login_rate_limit_per_minute =
            parse_rate("SYNC_GATEWAY_LOGIN_RATE_LIMIT_PER_MINUTE", 10)?;
        let trust_forwarded_for =
            parse_bool_lookup(&lookup, "SYNC_GATEWAY_TRUST_FORWARDED_FOR", false)
                .map_err(ConfigError::InvalidTrustForwardedFor)?;

        let request_timeout_seconds =
            parse_with_lookup(&lookup, "SYNC_GATEWAY_REQUEST_TIMEOUT_SECONDS", 30, |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(|value| value.clamp(1, 600))
                    .map_err(|error| ConfigError::InvalidRequestTimeoutSeconds(error.to_string()))
            })?;
        let max_body_bytes =
            parse_with_lookup(&lookup, "SYNC_GATEWAY_MAX_BODY_BYTES", 16 * 1024 * 1024, |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map(|value| value.max(1024))
                    .map_err(|error| ConfigError::InvalidMaxBodyBytes(error.to_string()))
            })?;
        let log_format = parse_log_format(
            lookup("SYNC_GATEWAY_LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .as_str(),
        )?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            db_connections,
            session_signing_key,
            session_ttl_seconds,
            session_cookie_secure,
            bootstrap_admin,
            public_api_url,
            cors_allowed_origins,
            rate_limit_per_minute,
            login_rate_limit_per_minute,
            trust_forwarded_for,
            request_timeout_seconds,
            max_body_bytes,
            log_format,
        })
    }

    /// True when sessions would be signed with the built-in development key
    /// while backed by a real database.
    #[must_use]
    pub fn uses_default_signing_key_with_database(&self) -> bool {
        self.db_url.is_some() && self.session_signing_key == DEFAULT_SESSION_SIGNING_KEY
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parser(raw),
        _ => Ok(default),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{key}: {other}")),
    }
}

fn normalize_origin_value(value: &str) -> String {
    value.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError, LogFormat};

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]).expect("defaults should parse");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:4200");
        assert_eq!(config.service_name, "sync-gateway");
        assert!(config.db_url.is_none());
        assert_eq!(config.db_connections, 4);
        assert_eq!(config.session_ttl_seconds, 28_800);
        assert!(config.bootstrap_admin.is_none());
        assert_eq!(config.public_api_url, "http://127.0.0.1:4200");
        assert!(config.cors_allowed_origins.is_empty());
        assert!(!config.trust_forwarded_for);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(!config.uses_default_signing_key_with_database());
    }

    #[test]
    fn default_signing_key_is_flagged_only_with_a_database() {
        let config = config_from(&[("DB_URL", "postgres://sync@localhost/sync")])
            .expect("db url should parse");
        assert!(config.uses_default_signing_key_with_database());

        let config = config_from(&[
            ("DB_URL", "postgres://sync@localhost/sync"),
            ("SYNC_GATEWAY_SESSION_SIGNING_KEY", "prod-secret"),
            ("SYNC_GATEWAY_TRUST_FORWARDED_FOR", "true"),
        ])
        .expect("overrides should parse");
        assert!(!config.uses_default_signing_key_with_database());
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let config = config_from(&[
            ("DATABASE_URL", " postgres://sync@localhost/sync "),
            ("SYNC_GATEWAY_DB_CONNECTIONS", "500"),
            ("SYNC_GATEWAY_SESSION_TTL_SECONDS", "5"),
            ("SYNC_GATEWAY_ADMIN_USERNAME", "root"),
            ("SYNC_GATEWAY_ADMIN_PASSWORD", "hunter2"),
            ("SYNC_GATEWAY_PUBLIC_API_URL", "https://sync.example.com/"),
            (
                "SYNC_GATEWAY_CORS_ALLOWED_ORIGINS",
                "https://Admin.example.com/, ,https://ops.example.com",
            ),
            ("SYNC_GATEWAY_LOG_FORMAT", "JSON"),
        ])
        .expect("overrides should parse");
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://sync@localhost/sync")
        );
        assert_eq!(config.db_connections, 64);
        assert_eq!(config.session_ttl_seconds, 60);
        let admin = config.bootstrap_admin.expect("bootstrap admin");
        assert_eq!(admin.username, "root");
        assert_eq!(config.public_api_url, "https://sync.example.com");
        assert_eq!(
            config.cors_allowed_origins,
            vec![
                "https://admin.example.com".to_string(),
                "https://ops.example.com".to_string()
            ]
        );
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn half_configured_bootstrap_admin_is_rejected() {
        let error = config_from(&[("SYNC_GATEWAY_ADMIN_USERNAME", "root")])
            .expect_err("missing password should fail");
        assert!(matches!(error, ConfigError::InvalidBootstrapAdmin(_)));
    }

    #[test]
    fn invalid_numeric_values_name_the_key() {
        let error = config_from(&[("SYNC_GATEWAY_LOGIN_RATE_LIMIT_PER_MINUTE", "lots")])
            .expect_err("invalid rate should fail");
        match error {
            ConfigError::InvalidRateLimit(message) => {
                assert!(message.contains("SYNC_GATEWAY_LOGIN_RATE_LIMIT_PER_MINUTE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
