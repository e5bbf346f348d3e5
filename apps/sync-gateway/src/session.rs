use std::{num::NonZeroU32, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ring::{digest, pbkdf2};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::credentials::random_hex;
use crate::store::{GatewayStore, StoreError};
use crate::types::AdminAccount;

static PASSWORD_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(iterations) => iterations,
    None => NonZeroU32::MIN,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("missing or invalid admin session")]
    Unauthenticated,
    #[error("admin session has been revoked")]
    SessionInvalidated,
    #[error("session storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        Self::Storage(error.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub admin_id: String,
    pub iat: usize,
    pub exp: usize,
    pub jti: String,
}

/// Verified admin attached to gated requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminIdentity {
    pub admin_id: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub token: String,
    pub identity: AdminIdentity,
}

/// Issues and checks signed admin session tokens. A token is only accepted
/// while its SHA-256 matches the reference stored on the admin account, so
/// logout or a newer login revokes it before expiry.
#[derive(Clone)]
pub struct SessionVerifier {
    store: Arc<dyn GatewayStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_seconds: u64,
}

impl SessionVerifier {
    pub fn new(store: Arc<dyn GatewayStore>, signing_key: &str, ttl_seconds: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            store,
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            validation,
            ttl_seconds: ttl_seconds.max(1),
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Creates the admin or refreshes its password. Any live session of an
    /// existing admin is revoked.
    pub async fn ensure_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AdminAccount, SessionError> {
        let salt = random_hex::<16>();
        let password_hash = hash_password(&salt, password);
        let admin = self
            .store
            .upsert_admin(AdminAccount {
                admin_id: uuid::Uuid::new_v4().to_string(),
                username: username.trim().to_string(),
                password_hash,
                salt,
                current_session_sha256: None,
            })
            .await?;
        tracing::info!(admin_id = %admin.admin_id, username = %admin.username, "admin account ready");
        Ok(admin)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedSession, SessionError> {
        let admin = self.store.admin_by_username(username.trim()).await?;
        let Some(admin) = admin else {
            // Same work as a real check so unknown usernames are not cheaper.
            let _ = hash_password("00", password);
            return Err(SessionError::InvalidCredentials);
        };
        if !verify_password(&admin, password) {
            tracing::warn!(username = %admin.username, "admin login rejected");
            return Err(SessionError::InvalidCredentials);
        }

        let now = Utc::now();
        let iat = now.timestamp().max(0) as usize;
        let exp = iat.saturating_add(self.ttl_seconds as usize);
        let claims = AdminClaims {
            sub: admin.username.clone(),
            admin_id: admin.admin_id.clone(),
            iat,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|error| SessionError::Storage(format!("sign session token: {error}")))?;
        self.store
            .set_admin_session(&admin.admin_id, &token_sha256(&token))
            .await?;

        tracing::info!(admin_id = %admin.admin_id, "admin session issued");
        Ok(IssuedSession {
            token,
            identity: AdminIdentity {
                admin_id: admin.admin_id,
                username: admin.username,
                expires_at: timestamp(exp),
            },
        })
    }

    pub async fn verify(&self, token: &str) -> Result<AdminIdentity, SessionError> {
        let token = token.trim();
        let claims = self.decode_claims(token)?;
        let admin = self
            .store
            .admin_by_id(&claims.admin_id)
            .await?
            .ok_or(SessionError::SessionInvalidated)?;
        match admin.current_session_sha256.as_deref() {
            Some(current) if current == token_sha256(token) => Ok(AdminIdentity {
                admin_id: admin.admin_id,
                username: admin.username,
                expires_at: timestamp(claims.exp),
            }),
            _ => Err(SessionError::SessionInvalidated),
        }
    }

    /// Clears the stored reference if `token` is still the current session.
    /// Calling it again, or with a stale token, is a no-op.
    pub async fn logout(&self, token: &str) -> Result<(), SessionError> {
        let token = token.trim();
        let Ok(claims) = self.decode_claims(token) else {
            return Ok(());
        };
        let cleared = self
            .store
            .clear_admin_session(&claims.admin_id, &token_sha256(token))
            .await?;
        if cleared {
            tracing::info!(admin_id = %claims.admin_id, "admin session revoked");
        }
        Ok(())
    }

    fn decode_claims(&self, token: &str) -> Result<AdminClaims, SessionError> {
        decode::<AdminClaims>(token, &self.decoding_key, &self.validation)
            .map(|decoded| decoded.claims)
            .map_err(|error| {
                tracing::debug!(reason = %error, "admin session token rejected");
                SessionError::Unauthenticated
            })
    }
}

fn timestamp(seconds: usize) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[must_use]
pub fn token_sha256(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// PBKDF2-HMAC-SHA256 over the password, salted with the admin's hex salt.
fn hash_password(salt_hex: &str, password: &str) -> String {
    let mut derived = [0u8; digest::SHA256_OUTPUT_LEN];
    pbkdf2::derive(
        PASSWORD_ALGORITHM,
        PBKDF2_ITERATIONS,
        salt_hex.as_bytes(),
        password.as_bytes(),
        &mut derived,
    );
    hex::encode(derived)
}

/// Constant-time check against the stored derivation.
fn verify_password(admin: &AdminAccount, password: &str) -> bool {
    let Ok(expected) = hex::decode(&admin.password_hash) else {
        return false;
    };
    pbkdf2::verify(
        PASSWORD_ALGORITHM,
        PBKDF2_ITERATIONS,
        admin.salt.as_bytes(),
        password.as_bytes(),
        &expected,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use ring::pbkdf2;

    use super::{
        AdminClaims, PBKDF2_ITERATIONS, SessionError, SessionVerifier, hash_password,
        verify_password,
    };
    use crate::store::memory;
    use crate::types::AdminAccount;

    const KEY: &str = "test-session-key";

    async fn verifier() -> Result<SessionVerifier> {
        let verifier = SessionVerifier::new(memory(), KEY, 3600);
        verifier.ensure_admin("root", "hunter2").await?;
        Ok(verifier)
    }

    #[tokio::test]
    async fn login_issues_a_verifiable_session() -> Result<()> {
        let verifier = verifier().await?;
        let session = verifier.login("root", "hunter2").await?;
        let identity = verifier.verify(&session.token).await?;
        assert_eq!(identity.username, "root");
        assert_eq!(identity, session.identity);
        Ok(())
    }

    #[test]
    fn password_hash_is_a_salted_pbkdf2_derivation() -> Result<()> {
        assert_eq!(PBKDF2_ITERATIONS.get(), 100_000);
        let admin = AdminAccount {
            admin_id: "a1".to_string(),
            username: "root".to_string(),
            password_hash: hash_password("0a1b", "hunter2"),
            salt: "0a1b".to_string(),
            current_session_sha256: None,
        };
        let derived = hex::decode(&admin.password_hash)?;
        assert_eq!(derived.len(), 32);
        assert!(
            pbkdf2::verify(
                pbkdf2::PBKDF2_HMAC_SHA256,
                PBKDF2_ITERATIONS,
                b"0a1b",
                b"hunter2",
                &derived,
            )
            .is_ok()
        );
        assert_ne!(admin.password_hash, hash_password("0a1c", "hunter2"));

        assert!(verify_password(&admin, "hunter2"));
        assert!(!verify_password(&admin, "hunter3"));
        let corrupted = AdminAccount {
            password_hash: "not-hex".to_string(),
            ..admin
        };
        assert!(!verify_password(&corrupted, "hunter2"));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_rejected() -> Result<()> {
        let verifier = verifier().await?;
        assert_eq!(
            verifier.login("root", "wrong").await.err(),
            Some(SessionError::InvalidCredentials)
        );
        assert_eq!(
            verifier.login("nobody", "hunter2").await.err(),
            Some(SessionError::InvalidCredentials)
        );
        Ok(())
    }

    #[tokio::test]
    async fn logout_and_relogin_invalidate_older_sessions() -> Result<()> {
        let verifier = verifier().await?;
        let first = verifier.login("root", "hunter2").await?;
        let second = verifier.login("root", "hunter2").await?;
        assert_eq!(
            verifier.verify(&first.token).await.err(),
            Some(SessionError::SessionInvalidated)
        );

        verifier.logout(&first.token).await?;
        verifier.verify(&second.token).await?;

        verifier.logout(&second.token).await?;
        verifier.logout(&second.token).await?;
        assert_eq!(
            verifier.verify(&second.token).await.err(),
            Some(SessionError::SessionInvalidated)
        );
        Ok(())
    }

    #[tokio::test]
    async fn forged_and_expired_tokens_are_unauthenticated() -> Result<()> {
        let verifier = verifier().await?;
        let session = verifier.login("root", "hunter2").await?;

        let forged = SessionVerifier::new(memory(), "other-key", 3600);
        forged.ensure_admin("root", "hunter2").await?;
        let foreign = forged.login("root", "hunter2").await?;
        assert_eq!(
            verifier.verify(&foreign.token).await.err(),
            Some(SessionError::Unauthenticated)
        );

        let expired = encode(
            &Header::default(),
            &AdminClaims {
                sub: "root".to_string(),
                admin_id: session.identity.admin_id.clone(),
                iat: 1_000,
                exp: 2_000,
                jti: "expired".to_string(),
            },
            &EncodingKey::from_secret(KEY.as_bytes()),
        )?;
        assert_eq!(
            verifier.verify(&expired).await.err(),
            Some(SessionError::Unauthenticated)
        );
        assert_eq!(
            verifier.verify("not-a-jwt").await.err(),
            Some(SessionError::Unauthenticated)
        );
        Ok(())
    }

    #[tokio::test]
    async fn refreshing_the_admin_keeps_its_id_and_revokes_sessions() -> Result<()> {
        let verifier = verifier().await?;
        let session = verifier.login("root", "hunter2").await?;
        let refreshed = verifier.ensure_admin("root", "correct horse").await?;
        assert_eq!(refreshed.admin_id, session.identity.admin_id);
        assert_eq!(
            verifier.verify(&session.token).await.err(),
            Some(SessionError::SessionInvalidated)
        );
        assert_eq!(
            verifier.login("root", "hunter2").await.err(),
            Some(SessionError::InvalidCredentials)
        );
        verifier.login("root", "correct horse").await?;
        Ok(())
    }
}
