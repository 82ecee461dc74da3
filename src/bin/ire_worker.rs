//! `ire-worker`: the long-running service entrypoint. Applies migrations,
//! starts the worker pool, and runs until SIGINT/SIGTERM.

use patient_ire::config::EngineConfig;
use patient_ire::engine::EngineHandles;
use patient_ire::store::schema;
use patient_ire::worker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.worker_count as u32 + 2)
        .connect(&config.database_url)
        .await?;

    schema::migrate(&pool).await?;
    tracing::info!(worker_count = config.worker_count, "migrations applied, starting worker pool");

    let handles = EngineHandles::new(pool, config);
    // The channel's producer side is the integration point for whatever
    // delivers raw records in a given deployment (a poller, a message-bus
    // consumer); wiring one in is deployment-specific and out of this
    // crate's scope, so `tx` is only held here to keep the channel open
    // until shutdown.
    let (tx, rx) = tokio::sync::mpsc::channel(1024);
    let tasks = worker::spawn_pool(handles, rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight work");
    drop(tx);
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
