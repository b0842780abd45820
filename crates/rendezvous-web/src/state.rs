//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request handlers
//! and WebSocket connections.

use std::time::Instant;

use rendezvous_broker::Broker;

use crate::WebConfig;

/// Shared state accessible from every Axum handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The broker every connection opens its session on.
    pub broker: Broker,

    /// Web server configuration.
    pub config: WebConfig,

    /// When the server was created; used for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(broker: Broker, config: WebConfig) -> Self {
        Self {
            broker,
            config,
            started_at: Instant::now(),
        }
    }
}
