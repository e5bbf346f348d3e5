use std::sync::Arc;

use chrono::Utc;

use crate::credentials::CredentialGenerator;
use crate::store::{GatewayStore, StoreError};
use crate::types::{
    ClientConfigBundle, ClientFields, ClientRecord, ClientSummary, IssuedCredentials,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("client not found")]
    NotFound,
    #[error("generated client id collided with an existing client; retry")]
    IdentifierCollision,
    #[error("storage error: {0}")]
    Storage(String),
}

fn storage(error: StoreError) -> RegistryError {
    match error {
        StoreError::NotFound(_) => RegistryError::NotFound,
        StoreError::Conflict(_) => RegistryError::IdentifierCollision,
        StoreError::Db(message) => RegistryError::Storage(message),
    }
}

/// Administrator-facing client roster: creation, token rotation, cascade
/// deletion and the config bundle handed to installations.
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn GatewayStore>,
    generator: Arc<dyn CredentialGenerator>,
    public_api_url: String,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        generator: Arc<dyn CredentialGenerator>,
        public_api_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            generator,
            public_api_url: public_api_url.into(),
        }
    }

    pub async fn create_client(
        &self,
        fields: ClientFields,
    ) -> Result<IssuedCredentials, RegistryError> {
        let fields = validate_fields(fields)?;
        let now = Utc::now();
        let record = ClientRecord {
            client_id: self.generator.client_id(),
            access_token: self.generator.access_token(),
            fields,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.insert_client(record).await.map_err(|error| {
            if matches!(error, StoreError::Conflict(_)) {
                tracing::warn!(reason = %error, "client id collision on create");
            }
            storage(error)
        })?;
        tracing::info!(client_id = %stored.client_id, "client registered");
        Ok(IssuedCredentials {
            client_id: stored.client_id,
            access_token: stored.access_token,
        })
    }

    /// Replaces every field and always rotates the access token.
    pub async fn update_client(
        &self,
        client_id: &str,
        fields: ClientFields,
    ) -> Result<IssuedCredentials, RegistryError> {
        let fields = validate_fields(fields)?;
        let updated = self
            .store
            .update_client(
                client_id.trim(),
                fields,
                self.generator.access_token(),
                Utc::now(),
            )
            .await
            .map_err(storage)?;
        tracing::info!(client_id = %updated.client_id, "client updated and token rotated");
        Ok(IssuedCredentials {
            client_id: updated.client_id,
            access_token: updated.access_token,
        })
    }

    pub async fn delete_client(&self, client_id: &str) -> Result<(), RegistryError> {
        let client_id = client_id.trim();
        self.store
            .delete_client(client_id)
            .await
            .map_err(storage)?;
        tracing::info!(client_id = %client_id, "client deleted with dependent rows");
        Ok(())
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientSummary>, RegistryError> {
        let clients = self.store.list_clients().await.map_err(storage)?;
        Ok(clients.iter().map(ClientSummary::from).collect())
    }

    pub async fn client_config(
        &self,
        client_id: &str,
    ) -> Result<ClientConfigBundle, RegistryError> {
        let record = self
            .store
            .get_client(client_id.trim())
            .await
            .map_err(storage)?
            .ok_or(RegistryError::NotFound)?;
        Ok(ClientConfigBundle {
            client_id: record.client_id,
            db_name: record.fields.db_name,
            access_token: record.access_token,
            api_url: self.public_api_url.clone(),
        })
    }
}

fn validate_fields(fields: ClientFields) -> Result<ClientFields, RegistryError> {
    Ok(ClientFields {
        db_name: required(fields.db_name, "dbName")?,
        db_user: required(fields.db_user, "dbUser")?,
        db_password: present(fields.db_password, "dbPassword")?,
        name: required(fields.name, "name")?,
        address: required(fields.address, "address")?,
        phone: required(fields.phone, "phone")?,
        username: required(fields.username, "username")?,
        password: present(fields.password, "password")?,
    })
}

fn required(value: String, field: &str) -> Result<String, RegistryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

/// Secrets are stored verbatim; only their presence is checked.
fn present(value: String, field: &str) -> Result<String, RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::Validation(format!("{field} is required")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use anyhow::Result;

    use super::{ClientRegistry, RegistryError};
    use crate::credentials::{CredentialGenerator, RandomCredentials};
    use crate::store::memory;
    use crate::types::{ClientFields, ACCESS_TOKEN_HEX_LEN, CLIENT_ID_DIGITS};

    struct FixedIdCredentials {
        tokens: AtomicUsize,
    }

    impl CredentialGenerator for FixedIdCredentials {
        fn client_id(&self) -> String {
            "0000000007".to_string()
        }

        fn access_token(&self) -> String {
            let next = self.tokens.fetch_add(1, Ordering::Relaxed);
            format!("{next:064x}")
        }
    }

    fn fields() -> ClientFields {
        ClientFields {
            db_name: "branch_db".to_string(),
            db_user: "branch".to_string(),
            db_password: "s3cret".to_string(),
            name: "North Branch".to_string(),
            address: "1 Main St".to_string(),
            phone: "555-0100".to_string(),
            username: "north".to_string(),
            password: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn create_issues_numeric_id_and_hex_token() -> Result<()> {
        let registry = ClientRegistry::new(memory(), Arc::new(RandomCredentials), "https://api");
        let issued = registry.create_client(fields()).await?;
        assert_eq!(issued.client_id.len(), CLIENT_ID_DIGITS);
        assert!(issued.client_id.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(issued.access_token.len(), ACCESS_TOKEN_HEX_LEN);
        assert!(issued.access_token.chars().all(|c| c.is_ascii_hexdigit()));

        let config = registry.client_config(&issued.client_id).await?;
        assert_eq!(config.db_name, "branch_db");
        assert_eq!(config.access_token, issued.access_token);
        assert_eq!(config.api_url, "https://api");
        Ok(())
    }

    #[tokio::test]
    async fn missing_field_is_named_in_validation_error() {
        let registry = ClientRegistry::new(memory(), Arc::new(RandomCredentials), "https://api");
        let result = registry
            .create_client(ClientFields {
                phone: "   ".to_string(),
                ..fields()
            })
            .await;
        match result {
            Err(RegistryError::Validation(message)) => assert!(message.contains("phone")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_collision_is_reported_and_keeps_original() -> Result<()> {
        let registry = ClientRegistry::new(
            memory(),
            Arc::new(FixedIdCredentials {
                tokens: AtomicUsize::new(0),
            }),
            "https://api",
        );
        let first = registry.create_client(fields()).await?;
        let second = registry
            .create_client(ClientFields {
                name: "Impostor".to_string(),
                ..fields()
            })
            .await;
        assert!(matches!(second, Err(RegistryError::IdentifierCollision)));

        let clients = registry.list_clients().await?;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "North Branch");
        let config = registry.client_config(&first.client_id).await?;
        assert_eq!(config.access_token, first.access_token);
        Ok(())
    }

    #[tokio::test]
    async fn update_rotates_token_and_unknown_ids_are_not_found() -> Result<()> {
        let registry = ClientRegistry::new(memory(), Arc::new(RandomCredentials), "https://api");
        let issued = registry.create_client(fields()).await?;
        let rotated = registry
            .update_client(
                &issued.client_id,
                ClientFields {
                    address: "2 Side St".to_string(),
                    ..fields()
                },
            )
            .await?;
        assert_eq!(rotated.client_id, issued.client_id);
        assert_ne!(rotated.access_token, issued.access_token);

        assert!(matches!(
            registry.update_client("0000000000", fields()).await,
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            registry.delete_client("0000000000").await,
            Err(RegistryError::NotFound)
        ));

        registry.delete_client(&issued.client_id).await?;
        assert!(matches!(
            registry.client_config(&issued.client_id).await,
            Err(RegistryError::NotFound)
        ));
        Ok(())
    }
}
