//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{router, AppState};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterRegistry;

/// HTTP server for the rate limit check service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared limiter registry
    registry: Arc<LimiterRegistry>,
    trust_forwarded: bool,
    /// Mount the counter reset route
    admin_routes: bool,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        registry: Arc<LimiterRegistry>,
        trust_forwarded: bool,
        admin_routes: bool,
    ) -> Self {
        Self {
            addr,
            registry,
            trust_forwarded,
            admin_routes,
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        let app = router(AppState {
            registry: self.registry,
            trust_forwarded: self.trust_forwarded,
            admin_routes: self.admin_routes,
        });

        info!(addr = %local_addr, "Starting HTTP server for rate limit service");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
