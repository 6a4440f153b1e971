//! Token claims and the identity derived from them.

use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, Result};

/// Role value that grants access to the administrative surface.
pub const ADMIN_ROLE: &str = "admin";

/// HS256 token claims.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issued-at (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Optional role (`"admin"` for operators).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Claims {
    /// Claims for `user_id` valid for `ttl` from now.
    pub fn for_user(user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.into(),
            exp: (now + ttl).timestamp(),
            iat: Some(now.timestamp()),
            iss: None,
            role: None,
        }
    }

    /// Set the role claim.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the issuer claim.
    #[must_use]
    pub fn with_issuer(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }
}

/// Authenticated principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// User id (`sub`).
    pub user_id: String,
    /// Whether the token carries the admin role.
    pub is_admin: bool,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            is_admin: claims.role.as_deref() == Some(ADMIN_ROLE),
            user_id: claims.sub,
        }
    }
}

/// Sign `claims` with an HS256 secret.
pub fn encode_token(claims: &Claims, secret: &str) -> Result<String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Issue(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_detected() {
        let claims = Claims::for_user("ops", Duration::minutes(5)).with_role("admin");
        let identity = Identity::from(claims);
        assert!(identity.is_admin);
        assert_eq!(identity.user_id, "ops");
    }

    #[test]
    fn other_roles_are_not_admin() {
        let claims = Claims::for_user("u1", Duration::minutes(5)).with_role("reviewer");
        assert!(!Identity::from(claims).is_admin);
    }

    #[test]
    fn encoded_token_has_three_segments() {
        let token = encode_token(&Claims::for_user("u1", Duration::minutes(1)), "s").unwrap();
        assert_eq!(token.split('.').count(), 3);
    }
}
