//! Reverse proxy to the backend module proxy.
//!
//! Admitted requests are replayed against the configured origin with the
//! caller's credential removed. Response bodies are streamed back without
//! buffering; module zips can be large.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};
use url::Url;

use super::auth::Decision;
use crate::allowlist::FORWARDED_FOR;
use crate::{Error, Result};

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to one backend origin.
pub struct Forwarder {
    client: reqwest::Client,
    backend: Url,
    max_body_size: usize,
}

impl Forwarder {
    /// Create a forwarder for `backend`.
    ///
    /// Redirects from the backend are passed through to the caller, not followed.
    pub fn new(backend: &str, timeout: Duration, max_body_size: usize) -> Result<Self> {
        let backend = Url::parse(backend)
            .map_err(|e| Error::Config(format!("Invalid backend URL {backend:?}: {e}")))?;

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("gha-goproxy-gate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            backend,
            max_body_size,
        })
    }

    /// Backend origin.
    #[must_use]
    pub fn backend(&self) -> &Url {
        &self.backend
    }

    /// URL on the backend for an inbound request URI.
    #[must_use]
    pub fn target_url(&self, uri: &Uri) -> Url {
        join_url(&self.backend, uri.path(), uri.query())
    }

    /// Forward `request` and stream the backend's answer back.
    ///
    /// Failures to reach the backend become `502 Bad Gateway`.
    pub async fn forward(&self, request: Request<Body>) -> Response {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let admitted_by = match request.extensions().get::<Decision>() {
            Some(Decision::Authorized { .. }) => "token",
            Some(Decision::Bypass) => "allowlist",
            _ => "none",
        };

        let (parts, body) = request.into_parts();
        let target = self.target_url(&parts.uri);

        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, limit = self.max_body_size, "Rejecting request body");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
        };

        debug!(method = %parts.method, url = %target, admitted_by, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, target.clone())
            .headers(outbound_headers(&parts.headers, peer))
            .body(body)
            .send()
            .await;

        match upstream {
            Ok(resp) => {
                let status = resp.status();
                let headers = strip_hop_by_hop(resp.headers());
                let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                error!(url = %target, error = %e, "Proxy error");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or("Error")).into_response()
}

/// Join the backend path and query with the request's, one slash between paths.
fn join_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let base_path = base.path();
    let joined = match (base_path.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base_path}{}", &path[1..]),
        (false, false) => format!("{base_path}/{path}"),
        _ => format!("{base_path}{path}"),
    };

    let query = match (
        base.query().filter(|q| !q.is_empty()),
        query.filter(|q| !q.is_empty()),
    ) {
        (Some(b), Some(r)) => Some(format!("{b}&{r}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    };

    let mut url = base.clone();
    url.set_path(&joined);
    url.set_query(query.as_deref());
    url
}

/// Copy `headers` without hop-by-hop entries, including those the
/// `Connection` header names.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    for name in &named {
        out.remove(name);
    }
    out
}

/// Headers sent to the backend: no hop-by-hop, no credential, no `Host`,
/// and the peer appended to `X-Forwarded-For`.
fn outbound_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(header::AUTHORIZATION);
    out.remove(header::HOST);

    if let Some(ip) = peer {
        let prior: Vec<&str> = headers
            .get_all(FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let value = if prior.is_empty() {
            ip.to_string()
        } else {
            format!("{}, {ip}", prior.join(", "))
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            out.insert(FORWARDED_FOR, value);
        }
    }

    out
}
