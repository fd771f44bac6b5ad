//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pgswitch coordinates zero-downtime switchover of a live service
/// from one PostgreSQL database to another.
#[derive(Parser, Debug)]
#[command(name = "pgswitch", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "pgswitch.toml"
    #[arg(short, long, default_value = "pgswitch.toml")]
    pub config: PathBuf,

    /// Connection URL of the authoritative database.
    #[arg(long)]
    pub db_url: Option<String>,

    /// Connection URL of the database to switch to.
    #[arg(long)]
    pub db_url_next: Option<String>,

    /// Log in JSON.
    #[arg(long)]
    pub json: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the service: routing, engine cycles and the switchover
    /// handler.
    Run,

    /// Launch the interactive switchover shell.
    SwitchoverShell,

    /// Apply or revert schema migrations.
    Migrate {
        /// Apply migrations up to and including this one.
        #[arg(long)]
        up: Option<String>,

        /// Revert migrations down to (excluding) this one.
        #[arg(long)]
        down: Option<String>,
    },

    /// Validate timezone rules, migration parity and database
    /// reachability.
    SelfTest {
        /// Skip checks that need a database.
        #[arg(long)]
        offline: bool,
    },

    /// Check the configuration file for errors.
    Configcheck,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["pgswitch", "run"]);
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.config, PathBuf::from("pgswitch.toml"));
    }

    #[test]
    fn test_parse_migrate_up() {
        let cli = Cli::parse_from(["pgswitch", "migrate", "--up", "change-log"]);
        match cli.command {
            Some(Commands::Migrate { up, down }) => {
                assert_eq!(up.as_deref(), Some("change-log"));
                assert!(down.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_urls() {
        let cli = Cli::parse_from([
            "pgswitch",
            "--db-url",
            "postgres://old/db",
            "--db-url-next",
            "postgres://next/db",
            "self-test",
            "--offline",
        ]);
        assert_eq!(cli.db_url.as_deref(), Some("postgres://old/db"));
        assert!(matches!(
            cli.command,
            Some(Commands::SelfTest { offline: true })
        ));
    }
}
