//! CLI entry point for the rendezvous broker.
//!
//! This binary provides the `rendezvous` command: `serve` runs the broker
//! behind its WebSocket endpoints, `check-config` prints the configuration
//! `serve` would use.

mod cli;
mod config;
mod helpers;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rendezvous_broker::Broker;
use rendezvous_web::WebServer;

use crate::cli::{Cli, Commands, ServeArgs};
use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` must be loaded before clap reads its env fallbacks.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    helpers::init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => cmd_serve(cli.config.as_deref(), &args).await,
        Commands::CheckConfig(args) => cmd_check_config(cli.config.as_deref(), &args),
    }
}

fn resolve_config(path: Option<&Path>, args: &ServeArgs) -> Result<AppConfig> {
    let config = AppConfig::load_optional(path)?.with_overrides(args);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(path: Option<&Path>, args: &ServeArgs) -> Result<()> {
    let config = resolve_config(path, args)?;
    info!(
        config_file = ?path,
        fan_out = ?config.broker.fan_out,
        "starting rendezvous broker"
    );

    let broker = Broker::new(config.broker);
    let server = WebServer::new(config.web, broker);
    let addr = server.addr();

    server
        .start_with_shutdown(helpers::shutdown_signal())
        .await
        .with_context(|| format!("web server on {addr} failed"))?;

    info!("rendezvous broker stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(path: Option<&Path>, args: &ServeArgs) -> Result<()> {
    let config = resolve_config(path, args)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}
