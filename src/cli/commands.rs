//! CLI command definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// converge - declarative resource reconciler.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the document (defaults to converge.yaml, searched upward).
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Flag binding, e.g. `--flag create_cluster=false`. Repeatable.
    #[arg(long = "flag", global = true, value_name = "NAME=VALUE")]
    pub flags: Vec<String>,

    /// Maximum concurrent provider operations (overrides the document).
    #[arg(
        long,
        global = true,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub parallelism: Option<usize>,

    /// Retries for transient provider errors.
    #[arg(long, global = true, default_value_t = 0)]
    pub retries: u32,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter document.
    Init {
        /// Directory to initialize.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the document and its resource graph.
    Validate {
        /// Show warnings.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the apply order.
    Graph,

    /// Show what apply would change.
    Plan {
        /// Skip reading resources from the provider.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Converge infrastructure towards the document.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Skip reading resources from the provider.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between the document, state and provider.
    Drift,

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show recorded state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock id to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "converge",
            "apply",
            "--yes",
            "--flag",
            "create_cluster=false",
            "--flag",
            "addons=true",
            "--parallelism",
            "8",
            "--output",
            "json",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Apply { yes: true, no_refresh: false }));
        assert_eq!(cli.flags, vec!["create_cluster=false", "addons=true"]);
        assert_eq!(cli.parallelism, Some(8));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.retries, 0);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = Cli::try_parse_from(["converge", "plan", "--parallelism", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let cli = Cli::try_parse_from(["converge", "plan", "--parallelism", "1"]).unwrap();
        assert_eq!(cli.parallelism, Some(1));
    }

    #[test]
    fn test_state_unlock() {
        let cli = Cli::try_parse_from(["converge", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { lock_id: None, force: true }
            }
        ));
    }
}
