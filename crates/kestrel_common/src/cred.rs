//! Credential retrieval.

use async_trait::async_trait;

use crate::error::KestrelResult;

/// A resolved set of signing credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Credentials {
        Credentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }
}

/// Source of signing credentials. Providers may rotate the returned keys;
/// the per-connection auth cache re-signs whenever the access key id
/// changes or the cached auth window expires.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn retrieve(&self) -> KestrelResult<Credentials>;
}

/// Fixed credentials, the production-default provider.
#[derive(Debug, Clone)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    pub fn new(credentials: Credentials) -> StaticCredentialsProvider {
        StaticCredentialsProvider { credentials }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn retrieve(&self) -> KestrelResult<Credentials> {
        Ok(self.credentials.clone())
    }
}
