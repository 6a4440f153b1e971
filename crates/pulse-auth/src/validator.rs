//! Handshake credential validation.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use pulse_settings::AuthSettings;
use tracing::debug;

use crate::claims::{Claims, Identity};
use crate::directory::AccountDirectory;
use crate::errors::{AuthError, Result};

/// Turns a bearer token into an [`Identity`] or rejects it.
#[async_trait]
pub trait CredentialValidator: Send + Sync + 'static {
    /// Validate signature, expiry, and account status.
    async fn validate(&self, token: &str) -> Result<Identity>;
}

/// HS256 JWT validator backed by an [`AccountDirectory`].
pub struct JwtCredentialValidator {
    key: DecodingKey,
    validation: Validation,
    directory: Arc<dyn AccountDirectory>,
}

impl JwtCredentialValidator {
    /// Validator for `secret` with default leeway.
    pub fn new(secret: &str, directory: Arc<dyn AccountDirectory>) -> Self {
        Self::from_settings(
            &AuthSettings {
                jwt_secret: secret.to_string(),
                ..AuthSettings::default()
            },
            directory,
        )
    }

    /// Validator configured from [`AuthSettings`].
    pub fn from_settings(settings: &AuthSettings, directory: Arc<dyn AccountDirectory>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = settings.leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = &settings.issuer {
            validation.set_issuer(&[iss.as_str()]);
        }
        Self {
            key: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            validation,
            directory,
        }
    }

    /// Verify the token alone, without the directory check.
    pub fn decode_claims(&self, token: &str) -> Result<Claims> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl CredentialValidator for JwtCredentialValidator {
    async fn validate(&self, token: &str) -> Result<Identity> {
        let claims = self.decode_claims(token)?;
        if !self.directory.is_active(&claims.sub).await? {
            debug!(user_id = %claims.sub, "rejecting token for inactive account");
            return Err(AuthError::InactiveAccount(claims.sub));
        }
        Ok(Identity::from(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::encode_token;
    use crate::directory::StaticAccountDirectory;
    use assert_matches::assert_matches;
    use chrono::Duration;

    const SECRET: &str = "test-secret";

    fn validator(dir: Arc<StaticAccountDirectory>) -> JwtCredentialValidator {
        JwtCredentialValidator::new(SECRET, dir)
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let v = validator(Arc::new(StaticAccountDirectory::new()));
        let token = encode_token(&Claims::for_user("u1", Duration::minutes(5)), SECRET).unwrap();
        let identity = v.validate(&token).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert!(!identity.is_admin);
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let v = validator(Arc::new(StaticAccountDirectory::new()));
        let token = encode_token(&Claims::for_user("u1", Duration::minutes(5)), "other").unwrap();
        assert_matches!(v.validate(&token).await, Err(AuthError::Invalid(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let v = validator(Arc::new(StaticAccountDirectory::new()));
        let token = encode_token(&Claims::for_user("u1", Duration::minutes(-10)), SECRET).unwrap();
        assert_matches!(v.validate(&token).await, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn inactive_account_is_rejected() {
        let dir = Arc::new(StaticAccountDirectory::new());
        dir.deactivate("u1");
        let v = validator(dir);
        let token = encode_token(&Claims::for_user("u1", Duration::minutes(5)), SECRET).unwrap();
        assert_matches!(
            v.validate(&token).await,
            Err(AuthError::InactiveAccount(u)) if u == "u1"
        );
    }

    #[tokio::test]
    async fn garbage_and_empty_tokens() {
        let v = validator(Arc::new(StaticAccountDirectory::new()));
        assert_matches!(v.validate("not.a.jwt").await, Err(AuthError::Invalid(_)));
        assert_matches!(v.validate("").await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn issuer_is_enforced_when_configured() {
        let settings = AuthSettings {
            jwt_secret: SECRET.into(),
            issuer: Some("pulse-issuer".into()),
            ..AuthSettings::default()
        };
        let v = JwtCredentialValidator::from_settings(
            &settings,
            Arc::new(StaticAccountDirectory::new()),
        );
        let plain = encode_token(&Claims::for_user("u1", Duration::minutes(5)), SECRET).unwrap();
        assert!(v.validate(&plain).await.is_err());
        let issued = encode_token(
            &Claims::for_user("u1", Duration::minutes(5)).with_issuer("pulse-issuer"),
            SECRET,
        )
        .unwrap();
        assert!(v.validate(&issued).await.is_ok());
    }
}
