//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// panelsync - URL-driven state sync for primary and pop-out windows
#[derive(Parser)]
#[command(
    name = "psync",
    about = "URL-driven state synchronization for primary and pop-out panel windows",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a primary window and a simulated pop-out against the in-memory vehicle API
    Demo,

    /// Decode a location query string and show the filters it maps to
    Parse {
        /// Query string, e.g. "?manufacturer=Ford&page=1"
        query: String,
    },

    /// Print the effective configuration as YAML
    Config,
}

/// Path of the log file written by the binary
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panelsync")
        .join("logs")
        .join("psync.log");
    debug!(?path, "get_log_path: returning path");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommand_with_global_flags() {
        let cli = Cli::try_parse_from(["psync", "parse", "?page=2", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Some(Command::Parse { query }) => assert_eq!(query, "?page=2"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_no_subcommand() {
        let cli = Cli::try_parse_from(["psync", "-c", "/tmp/psync.yml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/psync.yml")));
    }

    #[test]
    fn test_log_path_ends_with_file_name() {
        assert!(get_log_path().ends_with("panelsync/logs/psync.log"));
    }
}
