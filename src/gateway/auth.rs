//! Authorization middleware for the module proxy gateway
//!
//! Decision order:
//! - Origin allowlist bypass
//! - Bearer token verification (GitHub Actions OIDC)
//! - Module path must belong to the token's repository

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use tracing::{info, warn};

use crate::allowlist::{OriginAllowlist, client_ip};
use crate::error::AuthError;
use crate::matcher::{self, ModulePath};
use crate::oidc::{Claims, TokenVerifier};

/// Outcome of authorizing one request.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Client address is allowlisted; no credential was inspected.
    Bypass,
    /// Token verified and bound to the requested module.
    Authorized {
        /// `owner/repo` from the token
        repository: String,
        /// Module the request targets
        module_path: ModulePath,
        /// Full verified claims, kept for audit logging
        claims: Box<Claims>,
    },
    /// Request must not reach the backend.
    Denied(AuthError),
}

impl Decision {
    /// Whether the request may be forwarded.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }
}

/// Combines the allowlist and the token verifier into one verdict per request.
pub struct Authorizer {
    allowlist: OriginAllowlist,
    verifier: TokenVerifier,
}

impl Authorizer {
    /// Create an authorizer.
    pub fn new(allowlist: OriginAllowlist, verifier: TokenVerifier) -> Self {
        Self {
            allowlist,
            verifier,
        }
    }

    /// Authorize a request as of now.
    ///
    /// `path` is the raw (percent-encoded) request path.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        path: &str,
        peer: Option<SocketAddr>,
    ) -> Decision {
        self.authorize_at(headers, path, peer, Utc::now()).await
    }

    /// Authorize a request against an explicit clock.
    pub async fn authorize_at(
        &self,
        headers: &HeaderMap,
        path: &str,
        peer: Option<SocketAddr>,
        now: DateTime<Utc>,
    ) -> Decision {
        if self.allowlist.is_allowed(headers, peer) {
            return Decision::Bypass;
        }

        match self.authorize_token(headers, path, now).await {
            Ok(decision) => decision,
            Err(e) => Decision::Denied(e),
        }
    }

    async fn authorize_token(
        &self,
        headers: &HeaderMap,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.verifier.verify(token, now).await?;

        let decoded = decode_path(path)?;
        let module_path = matcher::extract_module_path(&decoded)?;

        if !matcher::matches_repository(&module_path, &claims.repository)? {
            return Err(AuthError::RepositoryMismatch {
                module: module_path.to_string(),
                claimed: claims.repository,
            });
        }

        Ok(Decision::Authorized {
            repository: claims.repository.clone(),
            module_path,
            claims: Box::new(claims),
        })
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingOrMalformedCredential("missing Authorization header"))?
        .to_str()
        .map_err(|_| AuthError::MissingOrMalformedCredential("non-ASCII Authorization header"))?;

    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
            if token.is_empty() {
                Err(AuthError::MissingOrMalformedCredential("empty bearer token"))
            } else {
                Ok(token)
            }
        }
        _ => Err(AuthError::MissingOrMalformedCredential(
            "expected 'Bearer <token>'",
        )),
    }
}

/// Percent-decode the request path and refuse dot segments or backslashes.
///
/// The backend URL is built from the raw path and resolves `.` and `..`
/// anywhere in it, including after the version marker, so such paths could
/// reach a module other than the one matched here.
fn decode_path(path: &str) -> Result<String, AuthError> {
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|e| AuthError::InvalidPath(format!("path is not valid UTF-8: {e}")))?;

    if decoded.contains('\\') || decoded.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(AuthError::InvalidPath(format!(
            "dot segment or backslash in {decoded:?}"
        )));
    }

    Ok(decoded.into_owned())
}

/// Authorization middleware
pub async fn authorize_middleware(
    State(authorizer): State<Arc<Authorizer>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let path = request.uri().path().to_string();
    let remote_ip = client_ip(request.headers(), peer)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    let decision = authorizer.authorize(request.headers(), &path, peer).await;

    match &decision {
        Decision::Bypass => {
            info!(remote_ip = %remote_ip, path = %path, "Request allowed by origin allowlist");
        }
        Decision::Authorized {
            repository,
            module_path,
            claims,
        } => {
            info!(
                remote_ip = %remote_ip,
                path = %path,
                repository = %repository,
                module = %module_path,
                workflow = %claims.workflow,
                run_id = %claims.run_id,
                actor = %claims.actor,
                "Request authenticated and authorized"
            );
        }
        Decision::Denied(err) => {
            let message = match err {
                AuthError::InvalidPath(_) => "Failed to extract module path",
                AuthError::InvalidModulePath(_) | AuthError::UnsupportedHost(_) => {
                    "Failed to match repository"
                }
                AuthError::RepositoryMismatch { .. } => "Repository mismatch",
                _ => "Authentication failed",
            };
            warn!(remote_ip = %remote_ip, path = %path, error = %err, "{message}");
            return denied_response(err.status_code());
        }
    }

    request.extensions_mut().insert(decision);
    next.run(request).await
}

/// Minimal plain-text denial; details stay in the logs.
fn denied_response(status: StatusCode) -> Response {
    let body = status.canonical_reason().unwrap_or("Error");
    if status == StatusCode::UNAUTHORIZED {
        (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
    } else {
        (status, body).into_response()
    }
}
