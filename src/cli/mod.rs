// src/cli/mod.rs — CLI definition (clap derive)

pub mod admin;
pub mod migrate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gentask",
    about = "Generation task orchestration and billing engine",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Log level used when RUST_LOG and GENTASK_LOG are unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool, poll driver, zombie reaper and HTTP API
    Serve,
    /// Run pending database migrations
    Migrate {
        /// Only show the current schema version
        #[arg(long)]
        status: bool,
        /// Revert the most recent migration
        #[arg(long)]
        rollback: bool,
    },
    /// Fail and refund tasks stuck in flight, once
    Sweep {
        /// Age after which a task counts as lost (defaults to the reaper threshold)
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
    /// Price an operation without charging anyone
    Estimate {
        /// Capability key: model:<provider/model>, node:<type> or module:<kind>
        #[arg(long)]
        capability: String,
        /// Duration in seconds
        #[arg(long)]
        duration: Option<f64>,
        /// Resolution (e.g. 1024x1024, 720p, 4k)
        #[arg(long)]
        resolution: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        /// Operation type for operation-priced capabilities
        #[arg(long)]
        operation: Option<String>,
        /// Number of outputs
        #[arg(long)]
        quantity: Option<u32>,
        /// Input length for per-character pricing
        #[arg(long)]
        characters: Option<u64>,
    },
    /// Credit a user's balance
    Grant {
        user: String,
        amount: i64,
        #[arg(long, default_value = "operator grant")]
        description: String,
    },
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage rules stored in the database
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand, Clone)]
pub enum UserAction {
    /// Create a user, or change an existing user's tier
    Add {
        user: String,
        /// user, vip, svip, admin or internal
        #[arg(long, default_value = "user")]
        tier: String,
        /// Membership expiry (RFC 3339, or YYYY-MM-DD for the end of that day, UTC)
        #[arg(long)]
        expires: Option<String>,
    },
    /// Show a user's tier, balance and recent credit movements
    Show {
        user: String,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

#[derive(Subcommand, Clone)]
pub enum RulesAction {
    /// Load pricing, permission and tier rules from a TOML file
    Import { file: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_estimate() {
        let cli = Cli::try_parse_from([
            "gentask",
            "estimate",
            "--capability",
            "module:video",
            "--duration",
            "5",
            "--resolution",
            "720p",
        ])
        .unwrap();
        match cli.command {
            Commands::Estimate {
                capability,
                duration,
                resolution,
                ..
            } => {
                assert_eq!(capability, "module:video");
                assert_eq!(duration, Some(5.0));
                assert_eq!(resolution.as_deref(), Some("720p"));
            }
            _ => panic!("expected estimate"),
        }
    }

    #[test]
    fn test_parse_user_add() {
        let cli = Cli::try_parse_from([
            "gentask", "user", "add", "alice", "--tier", "vip", "--expires", "2026-12-31",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::User {
                action: UserAction::Add { .. }
            }
        ));
    }
}
