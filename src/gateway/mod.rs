//! Gateway server implementation

pub mod auth;
pub mod proxy;
mod router;
mod server;

pub use auth::{Authorizer, Decision, authorize_middleware};
pub use proxy::Forwarder;
pub use router::{AppState, create_router};
pub use server::Gateway;
