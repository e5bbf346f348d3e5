use rand::{Rng, RngCore};

use crate::types::CLIENT_ID_DIGITS;

const CLIENT_ID_SPACE: u64 = 10_000_000_000;

/// Source of client identifiers and access tokens.
pub trait CredentialGenerator: Send + Sync {
    fn client_id(&self) -> String;
    fn access_token(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCredentials;

impl CredentialGenerator for RandomCredentials {
    fn client_id(&self) -> String {
        let value = rand::rng().random_range(0..CLIENT_ID_SPACE);
        format!("{value:0width$}", width = CLIENT_ID_DIGITS)
    }

    fn access_token(&self) -> String {
        random_hex::<32>()
    }
}

#[must_use]
pub fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
