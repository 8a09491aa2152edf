//! # Parley Server
//!
//! Realtime direct and group messaging with presence and delivery receipts.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with a config file
//! parley /path/to/parley.toml
//! parley --config /path/to/parley.toml
//!
//! # Override with environment variables
//! PARLEY_PORT=8080 PARLEY_BROKER__URL=redis://cache:6379 parley
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = config_path(std::env::args().skip(1));
    let config = config::Config::load(path.as_deref())?;

    tracing::info!(
        "Starting Parley server on {}:{} ({:?} broker)",
        config.host,
        config.port,
        config.broker.kind
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

/// Config path from `--config <path>` or a bare first argument.
fn config_path(mut args: impl Iterator<Item = String>) -> Option<String> {
    match args.next()?.as_str() {
        "--config" | "-c" => args.next(),
        path => Some(path.to_string()),
    }
}
