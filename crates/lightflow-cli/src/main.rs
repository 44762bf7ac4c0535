// Lightflow CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: The concrete broker/store clients are out-of-scope
// collaborators, so the CLI wires the in-process substrates and runs an
// embedded single-process deployment.
// Design Decision: Exit codes are part of the contract:
//   0 success, 1 user/config error, 2 broker/store unreachable,
//   3 unknown workflow.

mod commands;
mod context;
mod handlers;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lightflow")]
#[command(about = "Lightflow - distributed DAG workflow engine")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(
        long,
        short,
        env = "LIGHTFLOW_CONFIG",
        default_value = "lightflow.cfg",
        global = true
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration scaffolding
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommand,
    },

    /// Manage workflows and runs
    Workflow {
        #[command(subcommand)]
        command: commands::workflow::WorkflowCommand,
    },

    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: commands::worker::WorkerCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { command } => commands::config::run(command).await,
        Commands::Workflow { command } => commands::workflow::run(command, &cli.config).await,
        Commands::Worker { command } => commands::worker::run(command, &cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(commands::exit_code(&err))
        }
    }
}
