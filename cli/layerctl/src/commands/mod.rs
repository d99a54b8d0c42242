//! CLI commands.

mod detect;
mod fetch;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use plfm_layer_arena::config::ROOT_ENV;
use plfm_layer_arena::ArenaConfig;

use crate::output::OutputFormat;

/// layerctl - fetch, verify, and inspect filesystem layers.
#[derive(Debug, Parser)]
#[command(name = "layerctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the cached layers.
    #[arg(long, global = true, env = ROOT_ENV)]
    root: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log format written to stderr.
    #[arg(long, global = true, value_enum, env = "LAYERCTL_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and verify layers into the arena.
    Fetch(fetch::FetchCommand),

    /// Detect the compression of local layer files.
    Detect(detect::DetectCommand),
}

impl Cli {
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let mut config = ArenaConfig::from_env();
        if let Some(root) = self.root {
            config.root_dir = root;
        }

        let ctx = CommandContext {
            config,
            format: self.format,
        };

        match self.command {
            Commands::Fetch(cmd) => cmd.run(ctx).await,
            Commands::Detect(cmd) => cmd.run(ctx),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: ArenaConfig,
    pub format: OutputFormat,
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
    fn test_parse_fetch_flags() {
        let layer = format!("sha256:{}=http://localhost/blob", "0".repeat(64));
        let cli = Cli::try_parse_from([
            "layerctl",
            "--format",
            "json",
            "--root",
            "/tmp/arena",
            "fetch",
            layer.as_str(),
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/arena")));
        assert!(matches!(cli.command, Commands::Fetch(_)));
    }
}
