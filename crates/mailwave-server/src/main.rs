//! # mailwave-server
//!
//! Campaign send service.
//!
//! This binary provides:
//! - **Dispatch**: validates a send request, checks the credit ledger and
//!   filters opt-outs, then materializes one record per contact and
//!   sequence item
//! - **Delivery**: small batches go out inline, larger ones are handed to a
//!   background worker that delivers with bounded concurrency
//! - **REST API** (axum) for sends, progress, unsubscribe links and admin
//!   credit top-ups
//! - **Per-caller rate limiting**

mod api;
mod auth;
mod config;
mod db;
mod delivery;
mod dispatch;
mod error;
mod provider;
mod rate_limit;
mod worker;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use mailwave_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::db::SharedDb;
use crate::delivery::{Delivery, SenderSettings};
use crate::dispatch::Dispatcher;
use crate::provider::HttpProvider;
use crate::rate_limit::RateLimiter;
use crate::worker::WorkerLimits;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mailwave_server=debug")),
        )
        .init();

    info!("Starting Mailwave send service v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = SharedDb::new(Database::open_at(&config.database_path)?);

    let provider = HttpProvider::new(
        &config.provider_api_url,
        config.provider_api_key.clone(),
        config.provider_timeout,
    )?;

    let delivery = Delivery::new(
        db.clone(),
        Arc::new(provider),
        SenderSettings {
            from_address: config.from_address.clone(),
            unsubscribe_base_url: config.unsubscribe_base_url.clone(),
        },
    );

    let (worker_handle, _worker_task) = worker::spawn_worker(
        delivery.clone(),
        WorkerLimits {
            per_queue: config.worker_concurrency,
            queues: config.worker_max_queues,
            capacity: config.worker_queue_capacity,
        },
    );

    // Queues left pending or processing by a previous run.
    worker::resume_unfinished(&delivery, &worker_handle)?;

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let app_state = AppState {
        db,
        dispatcher: Dispatcher::new(delivery, worker_handle, config.fast_path_threshold),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict buckets idle >10 min
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
