//! Deferred webhook delivery
//!
//! [`DeliveryPolicy`] decides when a queued webhook first runs and what happens
//! when processing fails. [`WebhookDispatcher`] drains due tasks through the
//! [`WebhookHandler`].

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult, ErrorClass};
use crate::store::{TaskStatus, WebhookQueue, WebhookTask};
use crate::webhooks::{ProcessOutcome, ReconciliationStats, WebhookHandler};

/// Delay before a webhook is first processed, lets the subscribing request commit
pub const DEFAULT_WEBHOOK_DELAY: Duration = Duration::minutes(5);

pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

const RETRY_BASE: Duration = Duration::seconds(30);
const RETRY_CAP: Duration = Duration::hours(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, storage hiccups, lost optimistic races
    Transient,
    /// No company owns the referenced subscription (yet)
    Unresolved,
    /// Forged or malformed input, unknown entities; retrying cannot help
    Permanent,
}

impl FailureClass {
    pub fn of(error: &BillingError) -> Self {
        match error {
            BillingError::SubscriptionNotMapped(_) => FailureClass::Unresolved,
            e if e.is_transient() => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry(Duration),
    Drop,
}

/// How deferred webhook tasks are scheduled and retried
pub trait DeliveryPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn initial_delay(&self) -> Duration;

    /// `attempts` counts the run that just failed
    fn on_failure(&self, class: FailureClass, attempts: u32) -> Disposition;
}

/// Exponential backoff from 30 seconds, capped at an hour
pub fn retry_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let delay = RETRY_BASE * 2_i32.pow(exponent);
    if delay > RETRY_CAP {
        RETRY_CAP
    } else {
        delay
    }
}

/// Wait a fixed window before the first run; unresolved subscriptions are dropped
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: DEFAULT_WEBHOOK_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DeliveryPolicy for FixedDelay {
    fn name(&self) -> &'static str {
        "fixed-delay"
    }

    fn initial_delay(&self) -> Duration {
        self.delay
    }

    fn on_failure(&self, class: FailureClass, attempts: u32) -> Disposition {
        match class {
            FailureClass::Transient if attempts < self.max_attempts => {
                Disposition::Retry(retry_backoff(attempts))
            }
            _ => Disposition::Drop,
        }
    }
}

/// Run immediately and keep retrying tenant resolution with backoff
#[derive(Debug, Clone, Copy)]
pub struct BackoffResolution {
    pub max_attempts: u32,
}

impl Default for BackoffResolution {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DeliveryPolicy for BackoffResolution {
    fn name(&self) -> &'static str {
        "backoff"
    }

    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn on_failure(&self, class: FailureClass, attempts: u32) -> Disposition {
        match class {
            FailureClass::Transient | FailureClass::Unresolved if attempts < self.max_attempts => {
                Disposition::Retry(retry_backoff(attempts))
            }
            _ => Disposition::Drop,
        }
    }
}

/// Per-run counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub processed: usize,
    pub ignored: usize,
    pub retried: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Drains due webhook tasks
#[derive(Clone)]
pub struct WebhookDispatcher {
    queue: Arc<dyn WebhookQueue>,
    handler: WebhookHandler,
    policy: Arc<dyn DeliveryPolicy>,
    stats: Arc<ReconciliationStats>,
}

impl WebhookDispatcher {
    pub fn new(
        queue: Arc<dyn WebhookQueue>,
        handler: WebhookHandler,
        policy: Arc<dyn DeliveryPolicy>,
        stats: Arc<ReconciliationStats>,
    ) -> Self {
        Self {
            queue,
            handler,
            policy,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ReconciliationStats> {
        &self.stats
    }

    /// Claim and process up to `batch` due tasks
    pub async fn run_due(&self, now: OffsetDateTime, batch: u32) -> BillingResult<DispatchSummary> {
        let tasks = self.queue.claim_due(now, batch).await?;
        let mut summary = DispatchSummary {
            claimed: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            let result = self.handler.process(&task.signature, &task.payload).await;
            let settled = match result {
                Ok(ProcessOutcome::Applied { .. }) => {
                    self.stats.record_processed();
                    summary.processed += 1;
                    self.queue.complete(task.id, TaskStatus::Done, None).await
                }
                Ok(ProcessOutcome::Ignored { .. }) => {
                    self.stats.record_ignored();
                    summary.ignored += 1;
                    self.queue.complete(task.id, TaskStatus::Done, None).await
                }
                Err(e) => self.handle_failure(&task, now, e, &mut summary).await,
            };

            // The task stays claimed and is picked up again once it counts as stuck
            if let Err(e) = settled {
                tracing::error!(
                    task_id = %task.id,
                    error = %e,
                    "Failed to record webhook task outcome"
                );
            }
        }

        if summary.claimed > 0 {
            tracing::info!(
                policy = self.policy.name(),
                claimed = summary.claimed,
                processed = summary.processed,
                ignored = summary.ignored,
                retried = summary.retried,
                dropped = summary.dropped,
                failed = summary.failed,
                "Webhook dispatch run finished"
            );
        }
        Ok(summary)
    }

    async fn handle_failure(
        &self,
        task: &WebhookTask,
        now: OffsetDateTime,
        error: BillingError,
        summary: &mut DispatchSummary,
    ) -> BillingResult<()> {
        let class = FailureClass::of(&error);
        if error.class() == ErrorClass::Signature {
            self.stats.record_invalid_signature();
        }
        let message = error.to_string();

        match self.policy.on_failure(class, task.attempts) {
            Disposition::Retry(delay) => {
                self.stats.record_retried();
                summary.retried += 1;
                tracing::warn!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    retry_in_secs = delay.whole_seconds(),
                    error = %message,
                    "Webhook processing failed, retrying"
                );
                self.queue.reschedule(task.id, now + delay, &message).await
            }
            Disposition::Drop => {
                let status = if class == FailureClass::Transient {
                    summary.failed += 1;
                    tracing::error!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        error = %message,
                        "Webhook processing kept failing, giving up"
                    );
                    TaskStatus::Failed
                } else {
                    summary.dropped += 1;
                    if class == FailureClass::Unresolved {
                        self.stats.record_unresolved();
                        tracing::error!(
                            alert = "billing_desync",
                            task_id = %task.id,
                            attempts = task.attempts,
                            error = %message,
                            "Webhook references a subscription no company owns, dropping"
                        );
                    } else {
                        tracing::warn!(
                            task_id = %task.id,
                            error = %message,
                            "Dropping webhook that cannot be processed"
                        );
                    }
                    TaskStatus::Dropped
                };
                self.stats.record_dropped();
                self.queue.complete(task.id, status, Some(&message)).await
            }
        }
    }
}
