//! Gateway webhook handling
//!
//! Webhooks arrive as a `(signature, payload)` pair. Ingestion only checks the
//! pair is well formed and queues it; the MAC is verified when the task runs.
//! Processing re-enters the same lifecycle transitions the API uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewaySubscription, PaymentGateway};
use crate::ledger::LedgerService;
use crate::queue::DeliveryPolicy;
use crate::store::WebhookQueue;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 length
const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SubscriptionCanceled,
    SubscriptionWentPastDue,
    SubscriptionChargedSuccessfully,
    Other,
}

impl NotificationKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "subscription_canceled" => NotificationKind::SubscriptionCanceled,
            "subscription_went_past_due" => NotificationKind::SubscriptionWentPastDue,
            "subscription_charged_successfully" => {
                NotificationKind::SubscriptionChargedSuccessfully
            }
            _ => NotificationKind::Other,
        }
    }
}

/// Decoded webhook body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub subscription: Option<GatewaySubscription>,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        NotificationKind::parse(&self.kind)
    }
}

/// Signs and checks `"<public key>|<hex hmac>"` webhook signatures
///
/// The MAC key is the SHA-256 digest of the private key.
#[derive(Clone)]
pub struct WebhookVerifier {
    public_key: String,
    mac_key: [u8; 32],
}

impl WebhookVerifier {
    pub fn new(public_key: &str, private_key: &str) -> Self {
        Self {
            public_key: public_key.to_string(),
            mac_key: Sha256::digest(private_key.as_bytes()).into(),
        }
    }

    fn mac(&self, payload: &str) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| BillingError::Internal(format!("Invalid webhook MAC key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Structural check done on the request thread, no MAC involved
    pub fn check_well_formed(&self, signature: &str, payload: &str) -> BillingResult<()> {
        let (public_key, digest) = signature
            .split_once('|')
            .ok_or_else(|| BillingError::WebhookMalformed("signature has no key pair".into()))?;

        if public_key != self.public_key {
            return Err(BillingError::WebhookMalformed(format!(
                "unknown public key '{}'",
                public_key
            )));
        }
        if digest.len() != DIGEST_HEX_LEN || hex::decode(digest).is_err() {
            return Err(BillingError::WebhookMalformed(
                "signature digest is not hex HMAC-SHA256".into(),
            ));
        }
        if payload.trim().is_empty() {
            return Err(BillingError::WebhookMalformed("payload is empty".into()));
        }
        BASE64
            .decode(payload.trim())
            .map_err(|e| BillingError::WebhookMalformed(format!("payload is not base64: {}", e)))?;

        Ok(())
    }

    /// Authenticate the payload and decode the notification
    pub fn verify(&self, signature: &str, payload: &str) -> BillingResult<Notification> {
        self.check_well_formed(signature, payload)?;

        let (_, digest) = signature
            .split_once('|')
            .ok_or(BillingError::WebhookSignatureInvalid)?;
        let provided = hex::decode(digest).map_err(|_| BillingError::WebhookSignatureInvalid)?;
        let expected = self.mac(payload)?;

        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let body = BASE64
            .decode(payload.trim())
            .map_err(|e| BillingError::WebhookMalformed(format!("payload is not base64: {}", e)))?;
        serde_json::from_slice(&body)
            .map_err(|e| BillingError::WebhookMalformed(format!("invalid notification: {}", e)))
    }

    pub fn sign(&self, payload: &str) -> BillingResult<String> {
        Ok(format!("{}|{}", self.public_key, hex::encode(self.mac(payload)?)))
    }

    /// Encode and sign a notification, returning `(signature, payload)`
    pub fn encode(&self, notification: &Notification) -> BillingResult<(String, String)> {
        let body = serde_json::to_vec(notification)
            .map_err(|e| BillingError::Internal(format!("Failed to encode notification: {}", e)))?;
        let payload = BASE64.encode(body);
        let signature = self.sign(&payload)?;
        Ok((signature, payload))
    }
}

/// Reconciliation counters, shared between the dispatcher and the heartbeat
#[derive(Debug, Default)]
pub struct ReconciliationStats {
    processed: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
    invalid_signatures: AtomicU64,
    unresolved_subscriptions: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationSnapshot {
    pub processed: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub invalid_signatures: u64,
    pub unresolved_subscriptions: u64,
    pub retried: u64,
}

impl ReconciliationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_signature(&self) {
        self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolved(&self) {
        self.unresolved_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconciliationSnapshot {
        ReconciliationSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid_signatures: self.invalid_signatures.load(Ordering::Relaxed),
            unresolved_subscriptions: self.unresolved_subscriptions.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Queues verified-looking webhooks for deferred processing
#[derive(Clone)]
pub struct WebhookIngestor {
    verifier: WebhookVerifier,
    queue: Arc<dyn WebhookQueue>,
    policy: Arc<dyn DeliveryPolicy>,
}

impl WebhookIngestor {
    pub fn new(
        verifier: WebhookVerifier,
        queue: Arc<dyn WebhookQueue>,
        policy: Arc<dyn DeliveryPolicy>,
    ) -> Self {
        Self {
            verifier,
            queue,
            policy,
        }
    }

    /// Returns the queued task id; malformed input is rejected without queueing
    pub async fn accept(&self, signature: &str, payload: &str) -> BillingResult<Uuid> {
        if let Err(e) = self.verifier.check_well_formed(signature, payload) {
            tracing::warn!(error = %e, "Rejecting malformed gateway webhook");
            return Err(e);
        }

        let run_at = OffsetDateTime::now_utc() + self.policy.initial_delay();
        let id = self.queue.enqueue(signature, payload, run_at).await?;

        tracing::info!(task_id = %id, run_at = %run_at, "Queued gateway webhook");
        Ok(id)
    }
}

/// What processing did with a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied {
        kind: NotificationKind,
        subdomain: String,
        subscription_id: String,
    },
    /// Kinds this engine does not act on
    Ignored { kind: String },
}

/// Applies verified notifications to company state
#[derive(Clone)]
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    subscriptions: SubscriptionService,
    ledger: LedgerService,
    gateway: Arc<dyn PaymentGateway>,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        subscriptions: SubscriptionService,
        ledger: LedgerService,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            verifier,
            subscriptions,
            ledger,
            gateway,
        }
    }

    /// Verify, resolve and apply one webhook
    ///
    /// Safe to run more than once for the same payload: every transition is an
    /// overwrite and ledger rows are keyed by gateway transaction id.
    pub async fn process(&self, signature: &str, payload: &str) -> BillingResult<ProcessOutcome> {
        let notification = match self.verifier.verify(signature, payload) {
            Ok(notification) => notification,
            Err(BillingError::WebhookSignatureInvalid) => {
                tracing::error!(
                    signature = %signature,
                    "Webhook signature verification failed, possible forged request"
                );
                return Err(BillingError::WebhookSignatureInvalid);
            }
            Err(e) => return Err(e),
        };

        let kind = notification.kind();
        if kind == NotificationKind::Other {
            tracing::info!(kind = %notification.kind, "Ignoring unhandled webhook kind");
            return Ok(ProcessOutcome::Ignored {
                kind: notification.kind,
            });
        }

        let subscription = notification.subscription.ok_or_else(|| {
            BillingError::WebhookMalformed(format!(
                "{} notification has no subscription",
                notification.kind
            ))
        })?;

        let company = self
            .subscriptions
            .find_by_subscription_id(&subscription.id)
            .await?;

        tracing::info!(
            kind = %notification.kind,
            subdomain = %company.subdomain,
            subscription_id = %subscription.id,
            "Applying gateway webhook"
        );

        match kind {
            NotificationKind::SubscriptionCanceled => {
                self.subscriptions
                    .mark_canceled(&company.subdomain, &subscription)
                    .await?;
            }
            NotificationKind::SubscriptionWentPastDue => {
                self.subscriptions
                    .mark_past_due(&company.subdomain, &subscription)
                    .await?;
            }
            NotificationKind::SubscriptionChargedSuccessfully => {
                // The notification can trail the gateway; the fresh snapshot has the full history
                let latest = self.gateway.find_subscription(&subscription.id).await?;
                self.ledger.sync_transactions(&company, &latest).await?;
                self.subscriptions
                    .mark_active(&company.subdomain, &latest)
                    .await?;
            }
            NotificationKind::Other => {}
        }

        Ok(ProcessOutcome::Applied {
            kind,
            subdomain: company.subdomain,
            subscription_id: subscription.id,
        })
    }
}
