//! Error types for the gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for startup and runtime errors
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors (startup, configuration, serving)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Origin allowlist could not be built
    #[error("Allowlist error: {0}")]
    Allowlist(#[from] AuthError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Every reason the authorization pipeline can refuse a request.
///
/// Variants carry detail for the operational log only. Callers see the
/// generic status text from [`AuthError::status_code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// `Authorization` header absent or not `Bearer <token>`.
    #[error("Missing or malformed credential: {0}")]
    MissingOrMalformedCredential(&'static str),

    /// Token is not a three-part JWS or its header/payload cannot be decoded.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Token declares an algorithm outside the RSA PKCS#1 family.
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Token header carries no `kid`.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// `kid` absent from the key set even after a refresh.
    #[error("Unknown key ID: {0}")]
    KeyNotFound(String),

    /// Key set could not be fetched or parsed.
    #[error("Key source unavailable: {0}")]
    KeySourceUnavailable(String),

    /// Signature does not verify against the resolved key.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// `iss` claim is not the expected issuer.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// `aud` claim does not contain the expected audience.
    #[error("Invalid audience: expected {0}")]
    InvalidAudience(String),

    /// `exp` is not after the verification time.
    #[error("Token expired")]
    TokenExpired,

    /// Request path yields no module path.
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// Module path has fewer than `host/owner/repo` segments.
    #[error("Invalid module path format: {0}")]
    InvalidModulePath(String),

    /// Module host is not the supported code host.
    #[error("Unsupported module host: {0}")]
    UnsupportedHost(String),

    /// Token repository does not own the requested module.
    #[error("Repository mismatch: module {module} is not in {claimed}")]
    RepositoryMismatch {
        /// Module path requested.
        module: String,
        /// Repository claimed by the token.
        claimed: String,
    },

    /// Allowlist block entry is not valid CIDR notation.
    #[error("Invalid allowlist entry {entry:?}: {reason}")]
    InvalidAllowlistEntry {
        /// Entry as configured (trimmed).
        entry: String,
        /// Parser message.
        reason: String,
    },
}

impl AuthError {
    /// HTTP status returned to the caller for this denial.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPath(_) | Self::InvalidModulePath(_) | Self::UnsupportedHost(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RepositoryMismatch { .. } => StatusCode::FORBIDDEN,
            Self::InvalidAllowlistEntry { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}
