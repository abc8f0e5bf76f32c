//! HTTP router and handlers

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::Response,
    routing::any,
};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::auth::{Authorizer, authorize_middleware};
use super::proxy::Forwarder;

/// Shared application state
pub struct AppState {
    /// Per-request authorization
    pub authorizer: Arc<Authorizer>,
    /// Backend forwarding
    pub forwarder: Arc<Forwarder>,
    /// Deadline for producing a response head
    pub request_timeout: Duration,
}

/// Create the router
///
/// Every method and path goes through authorization, then to the backend.
/// Requests still pending after `request_timeout` get `504 Gateway Timeout`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let authorizer = Arc::clone(&state.authorizer);

    Router::new()
        .route("/", any(forward_handler))
        .route("/{*path}", any(forward_handler))
        .layer(middleware::from_fn_with_state(authorizer, authorize_middleware))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            state.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn forward_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    state.forwarder.forward(request).await
}
