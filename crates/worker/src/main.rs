//! Teamzones Background Worker
//!
//! Handles scheduled jobs including:
//! - Webhook queue processing (every 15 seconds)
//! - Reconciliation heartbeat (every 5 minutes)
//! - Finished webhook task cleanup (daily at 3:00 AM UTC)

mod webhook_processor;

use std::sync::Arc;

use anyhow::Context;
use teamzones_billing::BillingService;
use teamzones_shared::create_pool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::webhook_processor::{WebhookProcessor, DISPATCH_BATCH_SIZE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Teamzones Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);
    let processor = WebhookProcessor::new(billing, DISPATCH_BATCH_SIZE);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain due webhook tasks (every 15 seconds)
    // Overlapping ticks are skipped; claims are exclusive regardless.
    let dispatch_processor = processor.clone();
    let dispatch_lock = Arc::new(Mutex::new(()));
    scheduler
        .add(Job::new_async("*/15 * * * * *", move |_uuid, _l| {
            let processor = dispatch_processor.clone();
            let lock = dispatch_lock.clone();
            Box::pin(async move {
                let Ok(_guard) = lock.try_lock() else {
                    info!("Previous webhook dispatch still running, skipping tick");
                    return;
                };
                if let Err(e) = processor.process_due(OffsetDateTime::now_utc()).await {
                    error!(error = %e, "Webhook dispatch run failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook queue processing (every 15 seconds)");

    // Job 2: Heartbeat with reconciliation counters (every 5 minutes)
    let heartbeat_processor = processor.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let processor = heartbeat_processor.clone();
            Box::pin(async move {
                processor.log_heartbeat();
            })
        })?)
        .await?;
    info!("Scheduled: Reconciliation heartbeat (every 5 minutes)");

    // Job 3: Purge finished webhook tasks (daily at 3:00 AM UTC)
    let purge_processor = processor.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let processor = purge_processor.clone();
            Box::pin(async move {
                if let Err(e) = processor.purge_finished(OffsetDateTime::now_utc()).await {
                    error!(error = %e, "Failed to purge finished webhook tasks");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Finished webhook task cleanup (daily at 3:00 AM UTC)");

    // Start scheduler
    scheduler.start().await?;
    info!("Worker scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    Ok(())
}
