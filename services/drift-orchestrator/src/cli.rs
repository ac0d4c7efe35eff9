//! `churnguard` command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Churn model drift monitor and retrain pipeline.
#[derive(Debug, Parser)]
#[command(name = "churnguard", author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (json or yaml). Falls back to `CHURNGUARD_CONFIG_FILE`.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Output format for command results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// Full pipeline: new data -> ingest -> drift check -> retrain -> redeploy -> diagnose.
    Run,
    /// Merge every source file into the canonical dataset and update the provenance log.
    Ingest,
    /// Fit a model on the merged dataset and write it to the model directory.
    Train,
    /// Score the model in the model directory against the merged dataset.
    Score,
    /// Publish the model, its score and the merged dataset to production.
    Deploy,
    /// Report on the deployed snapshot using the held-out test data.
    Diagnose,
    /// Show pending source files, the deployed snapshot and the run lock holder.
    Status,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// YAML for humans.
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["churnguard", "status", "--config", "config.json", "--format", "json"]);
        assert_eq!(cli.command, Commands::Status);
        assert_eq!(cli.config, Some(PathBuf::from("config.json")));
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["churnguard", "run"]);
        assert_eq!(cli.command, Commands::Run);
        assert!(cli.config.is_none());
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
