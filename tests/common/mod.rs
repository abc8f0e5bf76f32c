//! Shared helpers for integration tests: fixture keys, token signing and an
//! in-process key source.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use gha_goproxy_gate::AuthError;
use gha_goproxy_gate::oidc::{GITHUB_ACTIONS_ISSUER, JwksDocument, KeySource};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

/// Audience every test verifier expects.
pub const AUDIENCE: &str = "https://github.com/my-org";

/// Key id of `signing.pem` in `jwks.json`.
pub const KID: &str = "test-key-1";

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Read a fixture file.
pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).unwrap()
}

/// The fixture key set.
pub fn jwks() -> JwksDocument {
    serde_json::from_str(&fixture("jwks.json")).unwrap()
}

/// Serves a fixed key set and counts fetches.
pub struct StaticKeySource {
    doc: JwksDocument,
    fetches: AtomicUsize,
}

impl StaticKeySource {
    pub fn new(doc: JwksDocument) -> Arc<Self> {
        Arc::new(Self {
            doc,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fixture() -> Arc<Self> {
        Self::new(jwks())
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwksDocument, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.doc.clone())
    }
}

/// A GitHub Actions payload for `repository`, valid for ten minutes.
pub fn claims(repository: &str) -> Value {
    json!({
        "iss": GITHUB_ACTIONS_ISSUER,
        "aud": AUDIENCE,
        "exp": Utc::now().timestamp() + 600,
        "iat": Utc::now().timestamp(),
        "sub": format!("repo:{repository}:ref:refs/heads/main"),
        "repository": repository,
        "repository_owner": repository.split('/').next().unwrap_or_default(),
        "workflow": "CI",
        "run_id": "1234567890",
        "actor": "octocat",
        "ref": "refs/heads/main",
        "event_name": "push"
    })
}

/// Sign `claims` with an RSA key from `pem_fixture`.
pub fn sign_with(claims: &Value, alg: Algorithm, kid: Option<&str>, pem_fixture: &str) -> String {
    let mut header = Header::new(alg);
    header.kid = kid.map(str::to_string);
    let key = EncodingKey::from_rsa_pem(fixture(pem_fixture).as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Sign `claims` with the fixture key under [`KID`].
pub fn sign(claims: &Value) -> String {
    sign_with(claims, Algorithm::RS256, Some(KID), "signing.pem")
}

/// Token for `repository` signed by the fixture key.
pub fn token_for(repository: &str) -> String {
    sign(&claims(repository))
}

/// Serve `app` on an ephemeral loopback port.
pub async fn spawn_server(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
