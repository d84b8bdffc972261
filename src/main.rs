//! curfew - MQTT-driven DNS curfew for Linux gateways
//!
//! Listens for block/unblock commands on a broker topic and enforces them
//! with packet-filter rules.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use curfew::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => curfew::commands::run::run(&args, &cli.config).await,
        Commands::Status => curfew::commands::status::run(&cli.config).await,
        Commands::Apply { payload } => curfew::commands::apply::run(&payload, &cli.config).await,
        Commands::Version => {
            println!("curfew {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
