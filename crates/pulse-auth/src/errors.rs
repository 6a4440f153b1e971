//! Auth error types.

/// Errors from credential validation and credential sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Token is absent or empty.
    #[error("missing credential")]
    Missing,

    /// Signature, format, or claims are not acceptable.
    #[error("invalid credential: {0}")]
    Invalid(String),

    /// Token `exp` is in the past.
    #[error("credential expired")]
    Expired,

    /// Token is valid but the account is not active.
    #[error("account {0} is not active")]
    InactiveAccount(String),

    /// The account directory could not be consulted.
    #[error("account directory unavailable: {0}")]
    Directory(String),

    /// Encoding a token failed.
    #[error("failed to issue credential: {0}")]
    Issue(String),

    /// A credential source could not produce a token.
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Invalid(err.to_string()),
        }
    }
}

/// Result type for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_display() {
        let err = AuthError::InactiveAccount("u1".into());
        assert_eq!(err.to_string(), "account u1 is not active");
    }

    #[test]
    fn expired_jwt_maps_to_expired() {
        let err: AuthError =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::ExpiredSignature)
                .into();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn other_jwt_errors_are_invalid() {
        let err: AuthError =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSignature)
                .into();
        assert!(matches!(err, AuthError::Invalid(_)));
    }
}
