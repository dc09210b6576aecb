//! Companion CLI Module
//! Command-line interface for the companion service

use clap::{Parser, Subcommand};

pub mod output;

#[derive(Parser, Debug)]
#[command(name = "companion")]
#[command(version)]
#[command(about = "Messaging companion with encrypted sessions and self-update", long_about = None)]
pub struct Cli {
    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the companion service until SIGINT/SIGTERM
    Run,

    /// Print a fresh ENCRYPTION_KEY value
    Keygen,

    /// Session vault maintenance
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Self-update management
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum VaultAction {
    /// Decrypt the vault and report whether it is usable
    Verify,
}

#[derive(Subcommand, Debug)]
pub enum UpdateAction {
    /// Ask the release feed whether a newer release exists
    Check,

    /// Show the persisted deployment state
    Status,
}
