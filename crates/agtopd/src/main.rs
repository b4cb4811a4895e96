//! agtopd — headless orchestrator daemon.
//!
//! Loads configuration, rehydrates prior sessions, and runs until
//! SIGINT. The terminal front-end talks to the engine in-process.

use agtop_core::config::Config;
use agtopd::Engine;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "agtopd", about = "agtop orchestrator daemon")]
struct Args {
    /// Config file; defaults to ./agtop.yaml then
    /// ~/.config/agtop/config.yaml.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_discovered()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let engine = Engine::new(config);
        match engine.start().await {
            Ok(reconnected) if !reconnected.is_empty() => {
                info!(count = reconnected.len(), "resumed reconnected runs");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "rehydration failed");
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
        }
        info!("received SIGINT");
        engine.shutdown().await;
    });

    Ok(())
}
