//! Hatchery binary.
//!
//! Runs the engine with the local process driver against the job server
//! configured through `HATCHERY_*` environment variables.

use std::sync::Arc;

use anyhow::Result;
use hatchery::client::HttpJobServer;
use hatchery::process::ProcessDriver;
use hatchery::queue::QueuePoller;
use hatchery::token::TokenIssuer;
use hatchery::{Config, Engine};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Jobs buffered between the queue poller and the dispatcher.
const INTAKE_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = %config.name,
        hostname = %config.hostname,
        model_type = %config.model_type,
        api_url = %config.api_url,
        "Starting hatchery"
    );

    let client = Arc::new(HttpJobServer::new(&config)?);
    let driver = Arc::new(ProcessDriver::new(config.api_url.clone()));
    let tokens = TokenIssuer::from_config(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (jobs_tx, jobs_rx) = mpsc::channel(INTAKE_DEPTH);

    let poller = QueuePoller::new(Arc::clone(&client), jobs_tx, config.queue_poll_interval);
    let poller_handle = tokio::spawn(poller.run(shutdown_rx.clone()));

    let engine = Engine::new(config, client, driver, tokens)?;
    let mut running = engine.start(jobs_rx, shutdown_rx);

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = running.heartbeat_finished() => {
            if let Err(e) = &result {
                error!(error = %e, "Heartbeat loop failed, exiting");
            }
            result
        }
    };

    let _ = shutdown_tx.send(true);

    info!("Waiting for loops to shut down...");
    running.join().await;
    if let Err(e) = poller_handle.await {
        error!(error = %e, "Queue poller panicked");
    }

    info!("Hatchery shutdown complete");
    outcome
}
