//! Service Credentials
//!
//! Issues the identity a service runs under.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

pub const SCOPE_SERVICE: &str = "service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub id: String,

    pub secret: String,
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// `None` when the issuer does not hand out credentials.
    async fn generate(&self, account: &str, scopes: &[&str]) -> Result<Option<Credentials>>;
}

/// Issues random secrets and remembers them for verification.
#[derive(Default)]
pub struct LocalIssuer {
    issued: RwLock<HashMap<String, (String, Vec<String>)>>,
}

impl LocalIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify(&self, id: &str, secret: &str) -> bool {
        let issued = self.issued.read().unwrap_or_else(|e| e.into_inner());
        issued.get(id).is_some_and(|(s, _)| s == secret)
    }

    pub fn scopes(&self, id: &str) -> Option<Vec<String>> {
        let issued = self.issued.read().unwrap_or_else(|e| e.into_inner());
        issued.get(id).map(|(_, scopes)| scopes.clone())
    }
}

#[async_trait]
impl CredentialIssuer for LocalIssuer {
    async fn generate(&self, account: &str, scopes: &[&str]) -> Result<Option<Credentials>> {
        let secret = uuid::Uuid::new_v4().to_string();
        let mut issued = self.issued.write().unwrap_or_else(|e| e.into_inner());
        issued.insert(
            account.to_string(),
            (
                secret.clone(),
                scopes.iter().map(|s| s.to_string()).collect(),
            ),
        );
        Ok(Some(Credentials {
            id: account.to_string(),
            secret,
        }))
    }
}

pub struct NoopIssuer;

#[async_trait]
impl CredentialIssuer for NoopIssuer {
    async fn generate(&self, _account: &str, _scopes: &[&str]) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_issuer_rotates_secret() {
        let issuer = LocalIssuer::new();
        let first = issuer
            .generate("foo-latest", &[SCOPE_SERVICE])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "foo-latest");
        assert!(issuer.verify("foo-latest", &first.secret));
        assert_eq!(issuer.scopes("foo-latest"), Some(vec!["service".to_string()]));

        let second = issuer
            .generate("foo-latest", &[SCOPE_SERVICE])
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.secret, second.secret);
        assert!(!issuer.verify("foo-latest", &first.secret));
    }

    #[tokio::test]
    async fn test_noop_issuer() {
        assert!(NoopIssuer.generate("a", &[]).await.unwrap().is_none());
    }
}
