use clap::{Parser, Subcommand};

/// Pulls upcoming events and delivers attendee rosters ahead of each one.
#[derive(Debug, Parser)]
#[command(name = "rollcall", version, about)]
pub struct Cli {
    /// Config file (default: $ROLLCALL_CONFIG, then ~/.rollcall/rollcall.toml)
    #[arg(long, short, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync-and-schedule loop until interrupted (default)
    Run,
    /// Run a single cycle: sync, reconcile, process due events, exit
    Sync,
    /// List events still waiting to be processed
    Pending,
    /// Show the most recent dead-letter entries
    DeadLetters {
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["rollcall"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["rollcall", "dead-letters", "--limit", "5", "--config", "r.toml"]);
        assert!(matches!(cli.command, Some(Command::DeadLetters { limit: 5 })));
        assert_eq!(cli.config.as_deref(), Some("r.toml"));
    }
}
