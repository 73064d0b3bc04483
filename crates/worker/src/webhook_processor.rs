//! Webhook queue processing
//!
//! Drains due webhook tasks through the billing dispatcher and purges finished
//! ones once they are past retention.

use std::sync::Arc;

use teamzones_billing::{BillingResult, BillingService, DispatchSummary, WebhookQueue};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Tasks claimed per dispatcher round trip
pub const DISPATCH_BATCH_SIZE: u32 = 50;

/// Upper bound on batches per run so one tick cannot starve the scheduler
const MAX_BATCHES_PER_RUN: usize = 20;

/// Finished tasks are kept this long for inspection
pub const FINISHED_TASK_RETENTION: Duration = Duration::days(7);

#[derive(Clone)]
pub struct WebhookProcessor {
    billing: Arc<BillingService>,
    batch_size: u32,
}

impl WebhookProcessor {
    pub fn new(billing: Arc<BillingService>, batch_size: u32) -> Self {
        Self {
            billing,
            batch_size: batch_size.max(1),
        }
    }

    /// Process every task due at `now`, batch by batch
    pub async fn process_due(&self, now: OffsetDateTime) -> BillingResult<DispatchSummary> {
        let mut total = DispatchSummary::default();

        for _ in 0..MAX_BATCHES_PER_RUN {
            let batch = self.billing.dispatcher.run_due(now, self.batch_size).await?;
            total.claimed += batch.claimed;
            total.processed += batch.processed;
            total.ignored += batch.ignored;
            total.retried += batch.retried;
            total.dropped += batch.dropped;
            total.failed += batch.failed;

            if batch.claimed < self.batch_size as usize {
                return Ok(total);
            }
        }

        warn!(
            claimed = total.claimed,
            "Webhook backlog larger than one run, continuing next tick"
        );
        Ok(total)
    }

    /// Delete finished tasks last touched before `now - retention`
    pub async fn purge_finished(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let purged = self
            .billing
            .queue
            .purge_finished(now - FINISHED_TASK_RETENTION)
            .await?;
        info!(purged = purged, "Purged finished webhook tasks");
        Ok(purged)
    }

    pub fn log_heartbeat(&self) {
        let stats = self.billing.stats.snapshot();
        info!(
            processed = stats.processed,
            ignored = stats.ignored,
            dropped = stats.dropped,
            invalid_signatures = stats.invalid_signatures,
            unresolved_subscriptions = stats.unresolved_subscriptions,
            retried = stats.retried,
            "Worker heartbeat - reconciliation counters"
        );
    }
}
