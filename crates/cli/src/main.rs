use clap::{Parser, Subcommand};

mod commands;
mod simulated;

use commands::{CheckConfigArgs, RunArgs};

#[derive(Parser)]
#[command(name = "fx-engine")]
#[command(about = "Multi-instrument trading decision and execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper trading session against a simulated market
    Run(RunArgs),
    /// Load and validate a configuration file
    CheckConfig(CheckConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            commands::run_session(args).await?;
        }
        Commands::CheckConfig(args) => {
            commands::run_check_config(&args)?;
        }
    }

    Ok(())
}
