//! Bridge server binary entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge::{AppState, BridgeServer, CliArgs, Config, LayoutStore, TargetRegistry};
use common::SystemClock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    tracing::info!(?config, "starting bridge");

    let clock = Arc::new(SystemClock);
    let store = Arc::new(LayoutStore::new(config.layouts_dir.clone(), clock.clone()));
    let registry = Arc::new(TargetRegistry::new(config.clone(), clock));

    // Reconnect retained targets from the stored descriptor before
    // accepting traffic.
    let entries = store.read_index().await?;
    registry.sync(&entries).await;

    let state = AppState {
        store,
        registry,
    };
    BridgeServer::new(state, config.port).run().await
}
