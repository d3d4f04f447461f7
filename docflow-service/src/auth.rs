//! Resolving API credentials to an owner id.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{ServiceError, ServiceResult};
use crate::ingestion::hash::sha256_hex;

/// Maps a presented credential to the owner it acts for
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> ServiceResult<String>;
}

/// Verifier backed by a fixed table of token digests.
///
/// Only SHA-256 digests are configured, never the tokens themselves.
pub struct StaticTokenVerifier {
    owners_by_digest: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        let owners_by_digest = tokens
            .iter()
            .map(|(digest, owner)| (digest.to_lowercase(), owner.clone()))
            .collect();
        Self { owners_by_digest }
    }

    pub fn is_empty(&self) -> bool {
        self.owners_by_digest.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> ServiceResult<String> {
        if credential.is_empty() {
            return Err(ServiceError::Unauthorized);
        }
        self.owners_by_digest
            .get(&sha256_hex(credential.as_bytes()))
            .cloned()
            .ok_or(ServiceError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_verifier() {
        let mut tokens = HashMap::new();
        tokens.insert(sha256_hex(b"secret-token").to_uppercase(), "alice".to_string());
        let verifier = StaticTokenVerifier::new(&tokens);

        assert_eq!(verifier.verify("secret-token").await.unwrap(), "alice");
        assert!(matches!(
            verifier.verify("wrong").await,
            Err(ServiceError::Unauthorized)
        ));
        assert!(matches!(
            verifier.verify("").await,
            Err(ServiceError::Unauthorized)
        ));
    }
}
