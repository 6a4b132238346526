//! Standalone inference server

use anyhow::{Context, Result};
use arena_core::ArenaConfig;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "arena-infer", version, about = "Serve actions from policy snapshots")]
struct Args {
    /// Arena configuration file
    #[arg(short, long, default_value = "arena.toml")]
    config: PathBuf,

    /// Override the models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Override the listening port
    #[arg(long)]
    port: Option<u16>,

    /// Seed for stochastic requests without one
    #[arg(long)]
    seed: Option<u64>,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ArenaConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;
    config.apply_env()?;
    if let Some(dir) = args.models_dir {
        config.inference.models_dir = dir;
    }
    if let Some(port) = args.port {
        config.ports.inference = port;
    }
    if let Some(seed) = args.seed {
        config.inference.default_seed = seed;
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = tx.send(true);
        }
    });

    info!("Serving models from {:?}", config.inference.models_dir);
    arena_infer::run(&config.inference, &config.ports.inference_address(), rx).await?;
    Ok(())
}
