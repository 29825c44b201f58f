//! Command-line argument parsing for canon
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// canon - terminal session sync and recovery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend address (tcp://host:port or unix://path)
    ///
    /// Overrides `connection.addr` from the config file.
    /// Example: tcp://127.0.0.1:3000 or unix:///tmp/canon.sock
    #[arg(long, env = "CANON_ADDR", global = true)]
    pub addr: Option<String>,

    /// Config file to use instead of the default location
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// More log output; repeat for more (overridden by CANON_LOG)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Keep the session cache in sync until interrupted (default)
    Sync,

    /// Print the cached sessions; works without a backend
    Sessions,

    /// Inspect and recover orphaned sessions
    Orphans {
        #[command(subcommand)]
        action: OrphanAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum OrphanAction {
    /// List registry sessions with no cached entry
    List,
    /// Reattach orphans and resync the cache
    Reattach(Targets),
    /// Terminate orphaned processes
    Kill(Targets),
}

/// Which orphans an operation applies to
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    /// Registry names of the orphans
    #[arg(required_unless_present = "all")]
    pub names: Vec<String>,

    /// Every currently listed orphan
    #[arg(long, conflicts_with = "names")]
    pub all: bool,
}

impl Args {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The subcommand, defaulting to `sync`
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sync() {
        let args = Args::parse_from(["canon"]);
        assert_eq!(args.command(), Command::Sync);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_addr_flag() {
        let args = Args::parse_from(["canon", "--addr", "tcp://localhost:3000", "sessions"]);
        assert_eq!(args.addr, Some("tcp://localhost:3000".to_string()));
        assert_eq!(args.command(), Command::Sessions);
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let args = Args::parse_from(["canon", "sync", "-c", "/tmp/canon.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/canon.toml")));
    }

    #[test]
    fn test_verbose_counts() {
        let args = Args::parse_from(["canon", "-vv", "sessions"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(Args::parse_from(["canon"]).verbose, 0);
    }

    #[test]
    fn test_orphan_kill_names() {
        let args = Args::parse_from(["canon", "orphans", "kill", "s1", "s2"]);
        assert_eq!(
            args.command(),
            Command::Orphans {
                action: OrphanAction::Kill(Targets {
                    names: vec!["s1".into(), "s2".into()],
                    all: false,
                })
            }
        );
    }

    #[test]
    fn test_orphan_reattach_all() {
        let args = Args::parse_from(["canon", "orphans", "reattach", "--all"]);
        match args.command() {
            Command::Orphans {
                action: OrphanAction::Reattach(targets),
            } => {
                assert!(targets.all);
                assert!(targets.names.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_orphan_kill_requires_targets() {
        assert!(Args::try_parse_from(["canon", "orphans", "kill"]).is_err());
        assert!(Args::try_parse_from(["canon", "orphans", "kill", "s1", "--all"]).is_err());
    }
}
