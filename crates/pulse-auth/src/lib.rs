//! # pulse-auth
//!
//! Credentials on both sides of the handshake.
//!
//! - Authority side: [`CredentialValidator`] turns the token from
//!   `/ws/{token}` into an [`Identity`]. [`JwtCredentialValidator`] checks an
//!   HS256 signature and expiry, then asks an [`AccountDirectory`] whether
//!   the account is active.
//! - Agent side: [`CredentialSource`] supplies the token before every
//!   connect attempt.

#![deny(unsafe_code)]

pub mod claims;
pub mod directory;
pub mod errors;
pub mod source;
pub mod validator;

pub use claims::{ADMIN_ROLE, Claims, Identity, encode_token};
pub use directory::{AccountDirectory, AllowAllDirectory, StaticAccountDirectory};
pub use errors::{AuthError, Result};
pub use source::{CredentialSource, SigningCredentialSource, StaticCredentialSource};
pub use validator::{CredentialValidator, JwtCredentialValidator};
