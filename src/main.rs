// Main binary: runs the task engine worker.
use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter};

use orchestra_engine::{run_worker, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Orchestra provisioning and deployment orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the task engine worker pool
    Worker,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let directives = format!(
        "orchestra={level},orchestra_engine={level},orchestra_queue={level},orchestra_ssh={level},sqlx=warn,russh=warn",
        level = default_level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    registry().with(filter).with(fmt::layer()).init();

    let config = Config::from_env()?;

    // Ctrl+C flips the shutdown signal; workers finish in-flight tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Ctrl+C received, sending shutdown signal...");
        let _ = shutdown_tx.send(true);
    });

    match cli.command {
        Commands::Worker => run_worker(config, shutdown_rx).await,
    }
}
