//! Main web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and starts
//! the HTTP listener.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use rendezvous_broker::Broker;

use crate::WebConfig;
use crate::api;
use crate::error::{Result, WebError};
use crate::state::AppState;
use crate::ws;

/// The rendezvous web server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a new web server around `broker`.
    pub fn new(config: WebConfig, broker: Broker) -> Self {
        let state = Arc::new(AppState::new(broker, config.clone()));
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET])
            .allow_headers(Any);

        let mut router = Router::new()
            // WebSocket endpoints.
            .route("/sourceAPI", get(ws::source_handler))
            .route("/targetAPI", get(ws::target_handler))
            // REST API.
            .route("/api/status", get(api::status));

        if let Some(dir) = &self.config.static_dir {
            tracing::debug!(dir = %dir.display(), "serving static assets");
            router = router.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
        }

        router.layer(cors).with_state(Arc::clone(&self.state))
    }

    /// Start the server and block until it is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> Result<()> {
        self.start_with_shutdown(std::future::pending()).await
    }

    /// Like [`start`](Self::start), stopping once `signal` resolves.
    pub async fn start_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| WebError::Bind { addr, source })?;
        self.serve(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        match listener.local_addr() {
            Ok(local) => tracing::info!(addr = %local, "starting web server"),
            Err(_) => tracing::info!(addr = %self.addr(), "starting web server"),
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(WebError::Serve)?;

        tracing::info!("web server stopped");
        Ok(())
    }
}
