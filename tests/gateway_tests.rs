//! End-to-end tests: real listeners for the gateway and a stub module proxy.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use gha_goproxy_gate::config::Config;
use gha_goproxy_gate::gateway::Gateway;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};

use common::{AUDIENCE, StaticKeySource, claims, sign, token_for};

/// What the stub backend observed for one request.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    uri: String,
    authorization: Option<String>,
    forwarded_for: Option<String>,
    body: String,
}

type Log = Arc<Mutex<Vec<Seen>>>;

async fn record(State(log): State<Log>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let get_header = |name: header::HeaderName| {
        parts
            .headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    };

    log.lock().push(Seen {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        authorization: get_header(header::AUTHORIZATION),
        forwarded_for: get_header(header::HeaderName::from_static("x-forwarded-for")),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    if parts.uri.path().ends_with("/@v/moved.info") {
        return (StatusCode::FOUND, [(header::LOCATION, "https://cdn.example.com/moved.info")])
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("ok {}", parts.uri.path()),
    )
        .into_response()
}

fn config_for(backend_url: &str, bypass: &[&str]) -> Config {
    let mut config = Config::default();
    config.auth.audience = AUDIENCE.to_string();
    config.auth.bypass_ip_list = bypass.iter().map(|s| (*s).to_string()).collect();
    config.backend.url = backend_url.to_string();
    config.backend.timeout = Duration::from_secs(2);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config
}

struct Harness {
    addr: SocketAddr,
    log: Log,
    client: reqwest::Client,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<gha_goproxy_gate::Result<()>>,
}

impl Harness {
    async fn start(bypass: &[&str]) -> Self {
        let log = Log::default();
        let backend = Router::new().fallback(record).with_state(Arc::clone(&log));
        let backend_addr = common::spawn_server(backend).await;

        let mut harness = Self::start_with_backend(&format!("http://{backend_addr}"), bypass).await;
        harness.log = log;
        harness
    }

    async fn start_with_backend(backend_url: &str, bypass: &[&str]) -> Self {
        Self::launch(config_for(backend_url, bypass)).await
    }

    async fn launch(config: Config) -> Self {
        config.validate().unwrap();

        let gateway = Gateway::with_key_source(config, StaticKeySource::fixture()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(gateway.serve(listener, async move {
            let _ = rx.await;
        }));

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            addr,
            log: Log::default(),
            client,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    /// Send a request line verbatim; HTTP clients normalize dot segments away.
    async fn raw_get(&self, path: &str, token: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {token}\r\nConnection: close\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    fn seen(&self) -> Vec<Seen> {
        self.log.lock().clone()
    }
}

#[tokio::test]
async fn allowlisted_origin_is_forwarded_without_credential() {
    // GIVEN: loopback is on the bypass list
    let h = Harness::start(&["127.0.0.1"]).await;

    // WHEN: requesting without any Authorization header
    let resp = h.get("/github.com/anything/else/@v/list", None).await;

    // THEN: admitted and forwarded
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok /github.com/anything/else/@v/list");
    assert_eq!(h.seen().len(), 1);
}

#[tokio::test]
async fn allowlist_entries_may_be_blocks() {
    let h = Harness::start(&["10.0.0.0/8", "127.0.0.0/8"]).await;

    let resp = h.get("/golang.org/x/text/@v/list", None).await;

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unlisted_origin_without_credential_is_unauthorized() {
    // GIVEN: loopback is not on the bypass list
    let h = Harness::start(&["10.0.0.0/8"]).await;

    // WHEN: requesting without a token
    let resp = h.get("/github.com/org/repo/@v/list", None).await;

    // THEN: 401 with a bearer challenge, backend untouched
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    assert_eq!(resp.text().await.unwrap(), "Unauthorized");
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn forwarded_for_header_selects_the_client() {
    let h = Harness::start(&["10.0.0.0/8"]).await;

    let resp = h
        .client
        .get(h.url("/github.com/org/repo/@v/list"))
        .header("x-forwarded-for", "10.1.2.3, 198.51.100.7")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let seen = h.seen();
    assert_eq!(seen[0].forwarded_for.as_deref(), Some("10.1.2.3, 198.51.100.7, 127.0.0.1"));
}

#[tokio::test]
async fn token_for_another_repository_is_forbidden() {
    // GIVEN: a valid token for org/repoA
    let h = Harness::start(&[]).await;
    let token = token_for("org/repoA");

    // WHEN: requesting a module of org/repoB
    let resp = h.get("/github.com/org/repoB/@v/list", Some(&token)).await;

    // THEN: 403, backend untouched
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.text().await.unwrap(), "Forbidden");
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn matching_token_is_forwarded_and_credential_stripped() {
    // GIVEN: a valid token for org/repo
    let h = Harness::start(&[]).await;
    let token = token_for("org/repo");

    // WHEN: requesting one of its versions
    let resp = h.get("/github.com/org/repo/@v/v1.2.3.info", Some(&token)).await;

    // THEN: forwarded, without the Authorization header
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok /github.com/org/repo/@v/v1.2.3.info");

    let seen = h.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].uri, "/github.com/org/repo/@v/v1.2.3.info");
    assert_eq!(seen[0].authorization, None);
    assert_eq!(seen[0].forwarded_for.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn repository_match_ignores_case_and_subpackages() {
    let h = Harness::start(&[]).await;
    let token = token_for("My-Org/My-Repo");

    for path in [
        "/github.com/my-org/my-repo/@latest",
        "/github.com/my-org/my-repo/v2/@v/list",
        "/github.com/MY-ORG/my-repo/internal/tools/@v/v0.1.0.mod",
    ] {
        let resp = h.get(path, Some(&token)).await;
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }
    assert_eq!(h.seen().len(), 3);
}

#[tokio::test]
async fn query_string_is_forwarded() {
    let h = Harness::start(&[]).await;

    let resp = h
        .get("/github.com/org/repo/@v/list?go-get=1", Some(&token_for("org/repo")))
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.seen()[0].uri, "/github.com/org/repo/@v/list?go-get=1");
}

#[tokio::test]
async fn non_github_module_with_token_is_bad_request() {
    let h = Harness::start(&[]).await;

    let resp = h.get("/gitlab.com/org/repo/@v/list", Some(&token_for("org/repo"))).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "Bad Request");
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn short_module_paths_are_bad_requests() {
    let h = Harness::start(&[]).await;
    let token = token_for("org/repo");

    for path in ["/", "/github.com/org/@v/list", "/github.com/@v/list"] {
        let resp = h.get(path, Some(&token)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{path}");
    }
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn dot_segments_cannot_retarget_the_backend() {
    // GIVEN: a token for org/repo
    let h = Harness::start(&[]).await;
    let token = token_for("org/repo");

    // WHEN: the version suffix climbs into another repository
    for path in [
        "/github.com/org/repo/@v/../../../../github.com/other/secret/@v/list",
        "/github.com/org/repo/@v/%2e%2e/%2e%2e/%2e%2e/%2e%2e/github.com/other/secret/@v/list",
    ] {
        let response = h.raw_get(path, &token).await;

        // THEN: rejected before anything is forwarded
        assert!(response.starts_with("HTTP/1.1 400"), "{path} -> {response}");
    }
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn credential_is_checked_before_path() {
    // A bad path without a token is still a 401, not a 400
    let h = Harness::start(&[]).await;

    let resp = h.get("/gitlab.com/org/repo/@v/list", None).await;

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_tokens_are_unauthorized() {
    let h = Harness::start(&[]).await;

    let mut expired = claims("org/repo");
    expired["exp"] = json!(1_600_000_000);
    let mut wrong_aud = claims("org/repo");
    wrong_aud["aud"] = json!("https://github.com/someone-else");

    for token in [sign(&expired), sign(&wrong_aud), "garbage".to_string()] {
        let resp = h.get("/github.com/org/repo/@v/list", Some(&token)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    let resp = h
        .client
        .get(h.url("/github.com/org/repo/@v/list"))
        .basic_auth("user", Some("pass"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn request_body_and_method_are_forwarded() {
    let h = Harness::start(&["127.0.0.1"]).await;

    let resp = h
        .client
        .post(h.url("/upload"))
        .body("module-bytes")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let seen = h.seen();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].body, "module-bytes");
}

#[tokio::test]
async fn backend_redirects_are_passed_through() {
    let h = Harness::start(&[]).await;

    let resp = h
        .get("/github.com/org/repo/@v/moved.info", Some(&token_for("org/repo")))
        .await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "https://cdn.example.com/moved.info"
    );
}

#[tokio::test]
async fn stalled_backend_is_cut_off() {
    // GIVEN: a backend that never answers within the request timeout
    let backend = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        "late"
    });
    let backend_addr = common::spawn_server(backend).await;
    let mut config = config_for(&format!("http://{backend_addr}"), &[]);
    config.server.request_timeout = Duration::from_millis(300);
    let h = Harness::launch(config).await;

    // WHEN: an authorized request is forwarded
    let started = std::time::Instant::now();
    let resp = h.get("/github.com/org/repo/@v/list", Some(&token_for("org/repo"))).await;

    // THEN: the gateway answers on its own deadline, before the backend timeout
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    // Nothing listens on the discard port
    let h = Harness::start_with_backend("http://127.0.0.1:9", &["127.0.0.1"]).await;

    let resp = h.get("/github.com/org/repo/@v/list", None).await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "Bad Gateway");
}

#[tokio::test]
async fn shutdown_stops_the_server() {
    let h = Harness::start(&["127.0.0.1"]).await;
    assert_eq!(h.get("/x", None).await.status(), StatusCode::OK);

    h.shutdown.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), h.handle)
        .await
        .unwrap()
        .unwrap();

    assert!(result.is_ok());
}
