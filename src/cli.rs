//! Command-line interface definition for Colloquy
//!
//! Defines the clap-derived CLI surface: the `serve` command that runs
//! the HTTP server plus one-off maintenance commands mirroring the
//! scheduled background jobs.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Colloquy - streaming assistant chat backend
#[derive(Parser, Debug)]
#[command(name = "colloquy", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "COLLOQUY_CONFIG")]
    pub config: Option<String>,

    /// Listen address override (e.g. 0.0.0.0:8080)
    #[arg(long)]
    pub listen: Option<String>,

    /// SQLite database path override
    #[arg(long, env = "COLLOQUY_DB")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server and background jobs
    Serve,

    /// Mark expired knowledge stores and exit
    CleanupStores,

    /// Proactively recreate expiring knowledge stores and exit
    RecreateStores,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_command_parses() {
        let cli = Cli::parse_from(["colloquy", "serve"]);
        assert!(matches!(cli.command, Commands::Serve));
        assert!(cli.listen.is_none());
    }

    #[test]
    fn test_listen_override_parses() {
        let cli = Cli::parse_from(["colloquy", "--listen", "0.0.0.0:9999", "serve"]);
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9999"));
    }

    #[test]
    fn test_cleanup_command_parses() {
        let cli = Cli::parse_from(["colloquy", "cleanup-stores"]);
        assert!(matches!(cli.command, Commands::CleanupStores));
    }
}
