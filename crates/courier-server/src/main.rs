//! # courier
//!
//! In-process instant-messaging relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the secret key from the environment
//! COURIER_SECRET_KEY=changeme courier
//!
//! # Or drop a courier.toml next to the binary; see config.rs for the
//! # recognized locations and options.
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
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; missing required options are fatal here.
    let config = config::Config::load()?;

    tracing::info!("Starting courier on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
