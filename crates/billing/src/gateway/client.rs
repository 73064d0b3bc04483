//! HTTP gateway client
//!
//! Thin JSON adapter over the gateway's merchant API. Writes are issued once;
//! subscription lookups are idempotent and retried with jittered backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    CustomerDetails, GatewayCustomer, GatewaySubscription, NewSubscription, PaymentGateway,
    PaymentMethod, SubscriptionUpdate,
};
use crate::error::{BillingError, BillingResult};

/// Gateway credentials and transport settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub public_key: String,
    pub private_key: String,
    pub timeout: Duration,
    /// Extra attempts for idempotent reads
    pub read_retries: usize,
}

impl GatewayConfig {
    pub fn new(
        base_url: impl Into<String>,
        merchant_id: impl Into<String>,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            merchant_id: merchant_id.into(),
            public_key: public_key.into(),
            private_key: private_key.into(),
            timeout: Duration::from_secs(30),
            read_retries: 3,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_retries(mut self, retries: usize) -> Self {
        self.read_retries = retries;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentMethodRequest<'a> {
    customer_id: &'a str,
    payment_method_nonce: &'a str,
}

/// Gateway client over HTTPS with basic auth
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build gateway client: {}", e)))?;

        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/merchants/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.merchant_id,
            path
        )
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> BillingResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .basic_auth(&self.config.public_key, Some(&self.config.private_key))
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                BillingError::Gateway(format!("Unexpected gateway response for {}: {}", path, e))
            });
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            method = %method,
            path = %path,
            status = %status,
            "Gateway call failed"
        );
        Err(map_status(status, path, body))
    }
}

fn map_status(status: StatusCode, path: &str, body: String) -> BillingError {
    let message = if body.is_empty() {
        format!("{} returned {}", path, status)
    } else {
        format!("{} returned {}: {}", path, status, body)
    };

    if status == StatusCode::NOT_FOUND {
        BillingError::NotFound(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BillingError::GatewayTransient(message)
    } else {
        BillingError::Gateway(message)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_customer(&self, customer: &CustomerDetails) -> BillingResult<GatewayCustomer> {
        self.send(Method::POST, "customers", Some(customer)).await
    }

    async fn create_payment_method(
        &self,
        customer_id: &str,
        nonce: &str,
    ) -> BillingResult<PaymentMethod> {
        let request = PaymentMethodRequest {
            customer_id,
            payment_method_nonce: nonce,
        };
        self.send(Method::POST, "payment_methods", Some(&request))
            .await
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<GatewaySubscription> {
        self.send(Method::POST, "subscriptions", Some(request)).await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<GatewaySubscription> {
        let path = format!("subscriptions/{}", subscription_id);
        self.send(Method::PUT, &path, Some(update)).await
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let path = format!("subscriptions/{}/cancel", subscription_id);
        self.send::<(), _>(Method::PUT, &path, None).await
    }

    async fn find_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription> {
        let path = format!("subscriptions/{}", subscription_id);
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(20)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.read_retries);

        RetryIf::spawn(
            strategy,
            || self.send::<(), GatewaySubscription>(Method::GET, &path, None),
            |e: &BillingError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Retrying subscription lookup after transient error"
                    );
                }
                retry
            },
        )
        .await
    }
}
