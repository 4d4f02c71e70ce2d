//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use strata_core::core::turn::StreamStatus;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version = "0.1")]
#[command(about = "Research transcript reconciliation and knowledge graph planning")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Replays recorded turns and prints the reconciled transcript as JSON
    Replay {
        /// JSON file with the recorded turns (array or stream snapshot)
        #[arg(long, value_name = "FILE")]
        turns: PathBuf,

        /// Stream status at the time of the recording
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Stream error reported with the recording
        #[arg(long)]
        error: Option<String>,

        /// Saved chat snapshot whose tool events are merged in
        #[arg(long, value_name = "SNAPSHOT")]
        persisted: Option<PathBuf>,
    },

    /// Places proposed nodes into a graph and prints the committed graph
    Plan {
        /// JSON file with the current graph ({nodes, edges})
        #[arg(long, value_name = "FILE")]
        graph: PathBuf,

        /// JSON file with the proposal service response (or a bare node array)
        #[arg(long, value_name = "FILE")]
        proposals: PathBuf,

        /// Turn recorded on nodes that do not name their own response
        #[arg(long, value_name = "ID")]
        response_id: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl From<StatusArg> for StreamStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Idle => StreamStatus::Idle,
            StatusArg::Submitted => StreamStatus::Submitted,
            StatusArg::Streaming => StreamStatus::Streaming,
            StatusArg::Error => StreamStatus::Error,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    dispatch(cli)
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Replay {
            turns,
            status,
            error,
            persisted,
        } => commands::replay::run(&commands::replay::ReplayOptions {
            turns: &turns,
            status: status.map(StreamStatus::from),
            error,
            persisted: persisted.as_deref(),
        }),

        Commands::Plan {
            graph,
            proposals,
            response_id,
        } => commands::plan::run(&graph, &proposals, response_id.as_deref()),

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
