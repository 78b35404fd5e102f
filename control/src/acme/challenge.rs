//! Pending HTTP-01 challenges
//!
//! The ACME client publishes key authorizations here while an order is being
//! validated; the control server answers `/.well-known/acme-challenge/{token}`
//! from the same store.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Path prefix the CA requests challenge responses under
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Thread-safe map of token -> key authorization
#[derive(Debug, Default)]
pub struct ChallengeStore {
    challenges: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_challenge(&self, token: &str, key_auth: &str) {
        let mut challenges = self.challenges.write().await;
        debug!(token = %token, "Adding HTTP-01 challenge");
        challenges.insert(token.to_string(), key_auth.to_string());
    }

    pub async fn remove_challenge(&self, token: &str) {
        let mut challenges = self.challenges.write().await;
        debug!(token = %token, "Removing HTTP-01 challenge");
        challenges.remove(token);
    }

    /// Key authorization for a token, if the token is pending
    pub async fn get_challenge(&self, token: &str) -> Option<String> {
        self.challenges.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.challenges.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_challenge_lifecycle() {
        let store = ChallengeStore::new();
        assert!(store.is_empty().await);

        store.add_challenge("tok1", "tok1.thumb").await;
        store.add_challenge("tok2", "tok2.thumb").await;
        assert_eq!(store.len().await, 2);
        assert_eq!(
            store.get_challenge("tok1").await,
            Some("tok1.thumb".to_string())
        );

        store.remove_challenge("tok1").await;
        assert_eq!(store.get_challenge("tok1").await, None);
        assert_eq!(store.len().await, 1);
    }
}
