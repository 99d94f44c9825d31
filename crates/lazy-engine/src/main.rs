use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use lazy_config::EngineConfig;
use lazy_runtime::tracing_init::init_tracing;
use lazy_runtime::{Engine, wait_for_signal};

#[derive(Parser)]
#[command(name = "lazyd", about = "Configurable log-processing pipeline engine")]
struct Cli {
    /// Path to the engine config file
    #[arg(short = 'c', long = "config", default_value = "lazy.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A bad config file is the only fatal start error: exit non-zero.
    let config = EngineConfig::load(&cli.config)?;
    let _guard = init_tracing(&config.logging)?;

    let metric_addr = config.metric_addr.clone();
    let engine = Engine::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(domain = "sys", metrics = %metric_addr, "lazy engine started");

    wait_for_signal(engine.cancel_token()).await;
    engine.shutdown();
    engine.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(())
}
