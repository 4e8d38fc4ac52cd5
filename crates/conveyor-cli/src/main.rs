//! Conveyor CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;
mod runner;

use commands::Commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about = "Deterministic pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            handlers::validate(&path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Expand { path } => {
            handlers::expand(&path)?;
            Ok(ExitCode::SUCCESS)
        }
        run @ Commands::Run { .. } => {
            let success = handlers::run(run).await?;
            Ok(if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
