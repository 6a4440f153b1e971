//! Client-side credential sources used by the agent before each connect.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::RwLock;

use crate::claims::{Claims, encode_token};
use crate::errors::{AuthError, Result};

/// Produces the bearer token for the next handshake.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// Current token.
    async fn token(&self) -> Result<String>;

    /// Obtain a fresh token after the authority rejected the last one.
    ///
    /// The default re-reads [`Self::token`].
    async fn refresh(&self) -> Result<String> {
        self.token().await
    }
}

/// A token supplied by the embedding application.
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    token: RwLock<String>,
}

impl StaticCredentialSource {
    /// Source returning `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    /// Replace the token (e.g. after the application re-authenticated).
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn token(&self) -> Result<String> {
        let token = self.token.read().clone();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(token)
    }
}

/// Mints a fresh HS256 token per request. For operator tooling that holds
/// the shared secret.
pub struct SigningCredentialSource {
    secret: String,
    user_id: String,
    role: Option<String>,
    ttl: Duration,
}

impl SigningCredentialSource {
    /// Source minting tokens for `user_id` valid for `ttl`.
    pub fn new(secret: impl Into<String>, user_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            user_id: user_id.into(),
            role: None,
            ttl,
        }
    }

    /// Mint tokens carrying `role`.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

#[async_trait]
impl CredentialSource for SigningCredentialSource {
    async fn token(&self) -> Result<String> {
        let mut claims = Claims::for_user(self.user_id.clone(), self.ttl);
        claims.role.clone_from(&self.role);
        encode_token(&claims, &self.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{CredentialValidator, JwtCredentialValidator};
    use crate::directory::AllowAllDirectory;
    use std::sync::Arc;

    #[tokio::test]
    async fn static_source_can_be_replaced() {
        let source = StaticCredentialSource::new("a");
        assert_eq!(source.token().await.unwrap(), "a");
        source.set("b");
        assert_eq!(source.refresh().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn empty_static_token_is_missing() {
        let source = StaticCredentialSource::default();
        assert_eq!(source.token().await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn signing_source_tokens_validate() {
        let source = SigningCredentialSource::new("s3", "ops", Duration::minutes(5))
            .with_role("admin");
        let token = source.token().await.unwrap();
        let validator = JwtCredentialValidator::new("s3", Arc::new(AllowAllDirectory));
        let identity = validator.validate(&token).await.unwrap();
        assert_eq!(identity.user_id, "ops");
        assert!(identity.is_admin);
    }
}
