//! WebSocket transport for the rendezvous broker.
//!
//! Sources and targets are separate processes that reach the broker over
//! HTTP.  This crate exposes:
//!
//! - `/sourceAPI` and `/targetAPI` WebSocket endpoints speaking the JSON
//!   protocol in [`protocol`].
//! - A REST status endpoint at `/api/status`.
//! - An optional static directory served at `/` for UI assets.

pub mod api;
pub mod error;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod state;
pub mod ws;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use error::{Result, WebError};
pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.  `0` picks an ephemeral port.
    pub port: u16,
    /// Directory served at `/`, if any.
    pub static_dir: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 3000,
            static_dir: None,
        }
    }
}

impl WebConfig {
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }
}
