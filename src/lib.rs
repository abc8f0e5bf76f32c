//! gha-goproxy-gate
//!
//! Authorization gateway in front of a private Go module proxy (GOPROXY).
//!
//! # Admission
//!
//! - **Origin allowlist**: callers whose address is listed skip verification
//! - **GitHub Actions OIDC**: a bearer token signed by the Actions issuer,
//!   for the configured audience, whose `repository` claim owns the
//!   requested `github.com/<owner>/<repo>` module
//!
//! Everything else is refused before it reaches the backend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod allowlist;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod matcher;
pub mod oidc;

pub use error::{AuthError, Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. Output is JSON unless `format`
/// is `text`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("text") => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))?,
    }

    Ok(())
}
