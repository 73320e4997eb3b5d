//! # Sandesh Coordinator
//!
//! Session signaling and notification-wakeup coordinator for realtime
//! consultations.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! sandesh
//!
//! # Run with a config file at ./sandesh.toml
//! sandesh
//!
//! # Run with environment variables
//! SANDESH_PORT=7400 SANDESH_HOST=0.0.0.0 sandesh
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandesh=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Sandesh coordinator on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
