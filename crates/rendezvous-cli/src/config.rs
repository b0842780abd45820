//! Layered configuration for the `rendezvous` binary.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, then flags
//! (which clap already fills from `RENDEZVOUS_*` variables and `.env`).
//!
//! ```toml
//! [broker]
//! max_listeners_per_connection = 1
//! fan_out = "per_consumer"
//!
//! [web]
//! bind_addr = "0.0.0.0"
//! port = 3000
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use rendezvous_broker::BrokerConfig;
use rendezvous_web::WebConfig;

use crate::cli::ServeArgs;

/// Everything the binary needs to start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub web: WebConfig,
}

impl AppConfig {
    /// Read `path` as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Defaults when no file is given.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, args: &ServeArgs) -> Self {
        if let Some(bind) = &args.bind {
            self.web.bind_addr = bind.clone();
        }
        if let Some(port) = args.port {
            self.web.port = port;
        }
        if let Some(dir) = &args.static_dir {
            self.web.static_dir = Some(dir.clone());
        }
        if let Some(max) = args.max_listeners {
            self.broker.max_listeners_per_connection = max;
        }
        if let Some(fan_out) = args.fan_out {
            self.broker.fan_out = fan_out.into();
        }
        self
    }

    /// Reject settings the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.max_listeners_per_connection == 0 {
            bail!("broker.max_listeners_per_connection must be at least 1");
        }
        if self.broker.typable_key_max_len == 0 || self.broker.rendezvous_key_max_len == 0 {
            bail!("key length limits must be at least 1");
        }
        if let Some(dir) = &self.web.static_dir {
            if !dir.is_dir() {
                bail!("static directory {} does not exist", dir.display());
            }
        }
        Ok(())
    }
}
