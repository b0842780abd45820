//! CLI argument definitions for the rendezvous broker.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use rendezvous_broker::FanOutPolicy;

/// rendezvous -- pairs deploying sources with waiting targets.
#[derive(Parser)]
#[command(
    name = "rendezvous",
    version,
    about = "rendezvous -- deployment matchmaking broker",
    long_about = "Pairs sources that offer key translations and deployment announcements \
                  with the targets waiting for them, over WebSocket."
)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, short, global = true, env = "RENDEZVOUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker and its WebSocket endpoints.
    Serve(ServeArgs),

    /// Print the effective configuration and exit.
    CheckConfig(ServeArgs),
}

/// Overrides applied on top of the configuration file.
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "RENDEZVOUS_BIND")]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long, short, env = "RENDEZVOUS_PORT")]
    pub port: Option<u16>,

    /// Waiting registrations allowed per connection, per relation.
    #[arg(long, env = "RENDEZVOUS_MAX_LISTENERS")]
    pub max_listeners: Option<usize>,

    /// How one deployment offer is shared between listeners.
    #[arg(long, value_enum, env = "RENDEZVOUS_FAN_OUT")]
    pub fan_out: Option<FanOut>,

    /// Directory of UI assets served at `/`.
    #[arg(long, env = "RENDEZVOUS_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FanOut {
    /// Invoke the producer once per listener.
    PerConsumer,
    /// Invoke the producer once and share the result.
    Shared,
}

impl From<FanOut> for FanOutPolicy {
    fn from(value: FanOut) -> Self {
        match value {
            FanOut::PerConsumer => FanOutPolicy::PerConsumer,
            FanOut::Shared => FanOutPolicy::Shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "rendezvous",
            "serve",
            "--port",
            "9000",
            "--fan-out",
            "shared",
            "--max-listeners",
            "4",
        ])
        .unwrap();

        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.fan_out, Some(FanOut::Shared));
        assert_eq!(args.max_listeners, Some(4));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["rendezvous", "check-config", "--config", "broker.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("broker.toml")));
        assert!(matches!(cli.command, Commands::CheckConfig(_)));
    }

    #[test]
    fn unknown_fan_out_is_rejected() {
        assert!(Cli::try_parse_from(["rendezvous", "serve", "--fan-out", "broadcast"]).is_err());
    }
}
