//! GitHub Actions OIDC token verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `alg` and `kid`.
//! 2. Reject anything outside the RSA PKCS#1 family (RS256/384/512); this
//!    blocks `none` and HMAC algorithm-confusion tokens.
//! 3. Resolve `kid` through the [`KeyCache`].
//! 4. Verify the signature with `jsonwebtoken`, its own claim checks off.
//! 5. Check `iss`, `aud`, then `exp` against the supplied clock, each with
//!    its own error.
//!
//! Nothing is cached per token; every call verifies from scratch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use super::jwks::KeyCache;
use crate::error::AuthError;
use crate::{Error, Result};

/// Issuer of GitHub Actions identity tokens.
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Algorithms accepted in the token header.
const ALLOWED_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// `aud` claim: a single string or a list of recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "value"`
    One(String),
    /// `"aud": ["a", "b"]`
    Many(Vec<String>),
}

impl Default for Audience {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Audience {
    /// Whether `expected` is one of the intended recipients.
    #[must_use]
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Self::One(aud) => aud == expected,
            Self::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

/// Claims of a verified GitHub Actions identity token.
///
/// Only `iss`, `aud`, `exp` and `repository` take part in authorization;
/// the rest is carried for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    pub iss: String,
    /// Intended audience(s)
    #[serde(default)]
    pub aud: Audience,
    /// Expiry (Unix seconds)
    pub exp: i64,
    /// Repository that ran the workflow, `owner/repo`
    #[serde(default)]
    pub repository: String,
    /// Workflow name
    #[serde(default)]
    pub workflow: String,
    /// Workflow run ID
    #[serde(default)]
    pub run_id: String,
    /// Account that triggered the run
    #[serde(default)]
    pub actor: String,
    /// Subject, e.g. `repo:owner/repo:ref:refs/heads/main`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Git ref the workflow ran on
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Commit SHA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Triggering event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Repository owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_owner: Option<String>,
}

/// Verifies identity tokens against one issuer and audience.
pub struct TokenVerifier {
    keys: Arc<KeyCache>,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Create a verifier for `audience`, trusting GitHub Actions as issuer.
    pub fn new(keys: Arc<KeyCache>, audience: impl Into<String>) -> Result<Self> {
        Self::with_issuer(keys, GITHUB_ACTIONS_ISSUER, audience)
    }

    /// Create a verifier with an explicit issuer (e.g. GitHub Enterprise Server).
    pub fn with_issuer(
        keys: Arc<KeyCache>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self> {
        let audience = audience.into();
        if audience.is_empty() {
            return Err(Error::Config("audience is required".to_string()));
        }
        let issuer = issuer.into();
        if issuer.is_empty() {
            return Err(Error::Config("issuer is required".to_string()));
        }

        Ok(Self {
            keys,
            issuer,
            audience,
        })
    }

    /// Expected `aud` value.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Expected `iss` value.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify `token` as of `now` and return its claims.
    pub async fn verify(&self, token: &str, now: DateTime<Utc>) -> std::result::Result<Claims, AuthError> {
        if token.split('.').count() != 3 {
            return Err(AuthError::MalformedToken("expected three dot-separated parts".into()));
        }

        let header = jsonwebtoken::decode_header(token).map_err(|e| match declared_alg(token) {
            // Well-formed header naming an algorithm jsonwebtoken does not know ("none")
            Some(alg) => AuthError::UnsupportedAlgorithm(alg),
            None => AuthError::MalformedToken(e.to_string()),
        })?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let kid = header
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(AuthError::MissingKeyId)?;

        let key = self.keys.get_key(kid).await?;

        let token_data =
            jsonwebtoken::decode::<Claims>(token, key.decoding_key(), &signature_only(header.alg))
                .map_err(|e| match e.kind() {
                    ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                    ErrorKind::InvalidAlgorithm => {
                        AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg))
                    }
                    _ => AuthError::MalformedToken(e.to_string()),
                })?;
        let claims = token_data.claims;

        if claims.iss != self.issuer {
            return Err(AuthError::InvalidIssuer(claims.iss));
        }

        if !claims.aud.contains(&self.audience) {
            return Err(AuthError::InvalidAudience(self.audience.clone()));
        }

        if claims.exp <= now.timestamp() {
            return Err(AuthError::TokenExpired);
        }

        Ok(claims)
    }
}

/// Read `alg` from the raw header without trusting anything else in it.
fn declared_alg(token: &str) -> Option<String> {
    let header = token.split('.').next()?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, header).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("alg")?.as_str().map(str::to_string)
}

/// Signature check only; claims are validated by hand afterwards.
fn signature_only(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.leeway = 0;
    validation
}
