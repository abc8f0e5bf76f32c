//! Signing key cache backed by the identity provider's published JWKS.
//!
//! # Refresh behaviour
//!
//! - Keys are fetched lazily on the first lookup and cached for the refresh
//!   interval (default 1 hour).
//! - A lookup that misses, or that arrives after the interval elapsed,
//!   triggers one refresh and retries once. A `kid` still absent afterwards
//!   is [`AuthError::KeyNotFound`].
//! - Refreshes are serialized. Tasks that queued behind a refresh which
//!   completed while they waited reuse its result instead of fetching again.
//! - A refresh replaces the whole key map in a single pointer swap; a failed
//!   refresh leaves the previous map in place.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// GitHub Actions OIDC key set.
pub const DEFAULT_JWKS_URL: &str = "https://token.actions.githubusercontent.com/.well-known/jwks";

/// How long a fetched key set is trusted before the next lookup refreshes it.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Upper bound on a single key set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw key set document: `{"keys": [...]}`.
///
/// Entries stay untyped so one malformed key cannot fail the whole document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwksDocument {
    /// Individual JWK objects.
    #[serde(default)]
    pub keys: Vec<serde_json::Value>,
}

/// Where key sets come from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwksDocument, AuthError>;
}

/// Fetches the key set over HTTP(S).
pub struct HttpKeySource {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySource {
    /// Create a source for `url` whose requests give up after `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gha-goproxy-gate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            url: url.into(),
            http,
        })
    }

    /// The key set URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwksDocument, AuthError> {
        debug!(url = %self.url, "Fetching JWKS");

        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeySourceUnavailable(e.to_string()))?;

        response
            .json::<JwksDocument>()
            .await
            .map_err(|e| AuthError::KeySourceUnavailable(format!("malformed JWKS: {e}")))
    }
}

/// A public RSA verification key.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    modulus: Vec<u8>,
    exponent: Vec<u8>,
    decoding: DecodingKey,
}

impl SigningKey {
    /// Build from big-endian modulus and exponent bytes.
    #[must_use]
    pub fn from_rsa_components(key_id: impl Into<String>, modulus: Vec<u8>, exponent: Vec<u8>) -> Self {
        let decoding = DecodingKey::from_rsa_raw_components(&modulus, &exponent);
        Self {
            key_id: key_id.into(),
            modulus,
            exponent,
            decoding,
        }
    }

    /// Key identifier (`kid`).
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Big-endian modulus bytes.
    #[must_use]
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Big-endian public exponent bytes.
    #[must_use]
    pub fn exponent(&self) -> &[u8] {
        &self.exponent
    }

    /// Key in the form `jsonwebtoken` verifies with.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("modulus_bits", &(self.modulus.len() * 8))
            .finish_non_exhaustive()
    }
}

/// One JWK entry as published.
#[derive(Debug, Deserialize)]
struct RawJwk {
    #[serde(default)]
    kid: String,
    kty: String,
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Immutable result of one refresh.
#[derive(Debug, Default)]
struct KeySnapshot {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Option<Instant>,
    generation: u64,
}

impl KeySnapshot {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < interval)
    }
}

/// Shared cache of the identity provider's signing keys.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    snapshot: RwLock<Arc<KeySnapshot>>,
    refresh_lock: Mutex<()>,
    refresh_interval: Duration,
    fetch_timeout: Duration,
}

impl KeyCache {
    /// Empty cache over `source` with default interval and timeout.
    #[must_use]
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self::with_settings(source, DEFAULT_REFRESH_INTERVAL, DEFAULT_FETCH_TIMEOUT)
    }

    /// Empty cache with explicit refresh interval and fetch timeout.
    #[must_use]
    pub fn with_settings(
        source: Arc<dyn KeySource>,
        refresh_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(KeySnapshot::default())),
            refresh_lock: Mutex::new(()),
            refresh_interval,
            fetch_timeout,
        }
    }

    /// Number of keys currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().keys.len()
    }

    /// Whether no keys are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().keys.is_empty()
    }

    /// Resolve `kid` to a signing key, refreshing at most once.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
        let observed = self.current();
        if observed.is_fresh(self.refresh_interval) {
            if let Some(key) = observed.keys.get(kid) {
                return Ok(Arc::clone(key));
            }
        }

        let _guard = self.refresh_lock.lock().await;

        let current = self.current();
        if current.generation != observed.generation {
            // A refresh finished while this task waited for the lock.
            return lookup(&current, kid);
        }
        if current.is_fresh(self.refresh_interval) {
            if let Some(key) = current.keys.get(kid) {
                return Ok(Arc::clone(key));
            }
        }

        debug!(kid = %kid, "Key not cached or cache stale, refreshing");
        let refreshed = self.refresh_locked(current.generation).await?;
        lookup(&refreshed, kid)
    }

    /// Fetch the key set now, regardless of age.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let generation = self.current().generation;
        let snapshot = self.refresh_locked(generation).await?;
        Ok(snapshot.keys.len())
    }

    fn current(&self) -> Arc<KeySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Caller holds `refresh_lock`.
    async fn refresh_locked(&self, generation: u64) -> Result<Arc<KeySnapshot>, AuthError> {
        let document = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(document)) => document,
            Ok(Err(e)) => {
                warn!(error = %e, "JWKS refresh failed");
                return Err(e);
            }
            Err(_elapsed) => {
                warn!(timeout = ?self.fetch_timeout, "JWKS refresh timed out");
                return Err(AuthError::KeySourceUnavailable(format!(
                    "fetch timed out after {:?}",
                    self.fetch_timeout
                )));
            }
        };

        let keys = parse_key_set(&document);
        info!(keys = keys.len(), published = document.keys.len(), "JWKS refreshed");

        let snapshot = Arc::new(KeySnapshot {
            keys,
            fetched_at: Some(Instant::now()),
            generation: generation + 1,
        });
        *self.snapshot.write() = Arc::clone(&snapshot);
        Ok(snapshot)
    }
}

fn lookup(snapshot: &KeySnapshot, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
    snapshot
        .keys
        .get(kid)
        .cloned()
        .ok_or_else(|| AuthError::KeyNotFound(kid.to_string()))
}

/// Keep usable RSA signature keys; skip everything else entry by entry.
fn parse_key_set(document: &JwksDocument) -> HashMap<String, Arc<SigningKey>> {
    let mut keys = HashMap::new();

    for value in &document.keys {
        let jwk: RawJwk = match serde_json::from_value(value.clone()) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(error = %e, "Skipping unparsable JWK");
                continue;
            }
        };

        if jwk.kty != "RSA" || jwk.kid.is_empty() {
            continue;
        }
        if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }

        match (decode_component(&jwk.n), decode_component(&jwk.e)) {
            (Some(n), Some(e)) => {
                let key = SigningKey::from_rsa_components(jwk.kid.clone(), n, e);
                keys.insert(jwk.kid, Arc::new(key));
            }
            _ => debug!(kid = %jwk.kid, "Skipping JWK with undecodable modulus or exponent"),
        }
    }

    keys
}

/// Decode a base64url key component, completing padding first.
fn decode_component(value: &str) -> Option<Vec<u8>> {
    let mut padded = value.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    base64::engine::general_purpose::URL_SAFE
        .decode(padded)
        .ok()
        .filter(|bytes| !bytes.is_empty())
}
