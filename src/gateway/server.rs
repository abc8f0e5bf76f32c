//! Gateway server

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::auth::Authorizer;
use super::proxy::Forwarder;
use super::router::{AppState, create_router};
use crate::allowlist::OriginAllowlist;
use crate::config::Config;
use crate::oidc::{HttpKeySource, KeyCache, KeySource, TokenVerifier};
use crate::{Error, Result};

/// Module proxy gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway that fetches signing keys from `auth.jwks_url`.
    pub fn new(config: Config) -> Result<Self> {
        let source = HttpKeySource::new(config.auth.jwks_url.clone(), config.auth.jwks_timeout)?;
        Self::with_key_source(config, Arc::new(source))
    }

    /// Create a gateway with an explicit key source.
    pub fn with_key_source(config: Config, source: Arc<dyn KeySource>) -> Result<Self> {
        let allowlist = OriginAllowlist::new(&config.auth.bypass_ip_list)?;
        if !allowlist.is_empty() {
            info!(entries = allowlist.len(), "Origin allowlist loaded");
        }

        let keys = Arc::new(KeyCache::with_settings(
            source,
            config.auth.jwks_refresh_interval,
            config.auth.jwks_timeout,
        ));
        let verifier =
            TokenVerifier::with_issuer(keys, config.auth.issuer.clone(), config.auth.audience.clone())?;

        let forwarder = Forwarder::new(
            &config.backend.url,
            config.backend.timeout,
            config.server.max_body_size,
        )?;

        let state = Arc::new(AppState {
            authorizer: Arc::new(Authorizer::new(allowlist, verifier)),
            forwarder: Arc::new(forwarder),
            request_timeout: config.server.request_timeout,
        });

        Ok(Self { config, state })
    }

    /// Run the gateway until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight
    /// requests for at most `server.shutdown_timeout`.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let app = create_router(Arc::clone(&self.state));

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %local_addr,
            backend = %self.state.forwarder.backend(),
            bypass_entries = self.config.auth.bypass_ip_list.len(),
            audience = %self.config.auth.audience,
            "gha-goproxy-gate listening"
        );

        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let signal = async move {
            shutdown.await;
            let _ = drain_tx.send(());
        };

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .into_future();
        tokio::pin!(server);

        tokio::select! {
            res = &mut server => res?,
            _ = drain_rx => {
                let deadline = self.config.server.shutdown_timeout;
                match tokio::time::timeout(deadline, &mut server).await {
                    Ok(res) => res?,
                    Err(_) => warn!(timeout = ?deadline, "Graceful shutdown timed out, dropping open connections"),
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
