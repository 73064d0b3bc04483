//! Tax and VAT Handling
//!
//! Provides tax-related functionality including:
//! - VAT rates per country (static table loaded once at start-up)
//! - VAT-inclusive pricing with floor rounding
//! - Re-subscription credit for the unused part of a canceled period
//! - VAT ID verification against the EU VIES service

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

/// EU member states and the standard VAT rate charged to customers without a VAT ID
const EU_VAT_RATES: &[(&str, u32)] = &[
    ("AT", 20),
    ("BE", 21),
    ("BG", 20),
    ("CY", 19),
    ("CZ", 21),
    ("DE", 19),
    ("DK", 25),
    ("EE", 20),
    ("ES", 21),
    ("FI", 24),
    ("FR", 20),
    ("GB", 20),
    ("GR", 24),
    ("HR", 25),
    ("HU", 27),
    ("IE", 23),
    ("IT", 22),
    ("LT", 21),
    ("LU", 17),
    ("LV", 21),
    ("MT", 18),
    ("NL", 21),
    ("PL", 23),
    ("PT", 23),
    ("RO", 19),
    ("SE", 25),
    ("SI", 22),
    ("SK", 20),
];

/// Country code -> VAT percentage
#[derive(Debug, Clone)]
pub struct VatTable {
    rates: HashMap<String, u32>,
}

impl Default for VatTable {
    fn default() -> Self {
        Self::eu_default()
    }
}

impl VatTable {
    pub fn new(rates: HashMap<String, u32>) -> Self {
        let rates = rates
            .into_iter()
            .map(|(country, rate)| (country.to_ascii_uppercase(), rate))
            .collect();
        Self { rates }
    }

    pub fn eu_default() -> Self {
        Self::new(
            EU_VAT_RATES
                .iter()
                .map(|(country, rate)| (country.to_string(), *rate))
                .collect(),
        )
    }

    /// Load a `{"DE": 19, ...}` map
    pub fn from_json_file(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("Failed to read VAT rates from {}: {}", path.display(), e))
        })?;
        let rates: HashMap<String, u32> = serde_json::from_str(&raw)
            .map_err(|e| BillingError::Config(format!("Invalid VAT rate table: {}", e)))?;

        tracing::info!(countries = rates.len(), "Loaded VAT rate table");
        Ok(Self::new(rates))
    }

    /// VAT percentage for a country, 0 outside VAT-charging jurisdictions
    pub fn lookup(&self, country: &str) -> u32 {
        self.rates
            .get(&country.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// VAT owed by a customer, taking their VAT ID into account
    pub fn percent_for(&self, country: &str, vat_id: &str) -> u32 {
        if vat_id.is_empty() {
            self.lookup(country)
        } else {
            0
        }
    }
}

/// Price charged to the customer: base plus VAT, VAT rounded down
pub fn effective_price(base_price: i64, vat_percent: u32) -> i64 {
    if vat_percent == 0 {
        return base_price;
    }

    base_price + (i64::from(vat_percent) * base_price).div_euclid(100)
}

/// Credit owed for the unused part of a previous paid period
///
/// Whole days left until `valid_until` times the previous plan's daily rate. VAT is
/// not included, it is applied to the final charge.
pub fn resubscribe_discount(previous: &Plan, valid_until: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let hours = (valid_until - now).whole_hours();
    let days = hours.div_euclid(24);
    if days <= 0 {
        return 0;
    }

    days * (previous.price / previous.cycle.days())
}

/// Checks whether a VAT ID is registered
#[async_trait]
pub trait VatIdVerifier: Send + Sync {
    async fn verify(&self, vat_id: &str) -> bool;
}

/// Strip surrounding whitespace and inner spaces from a VAT ID
pub fn sanitize_vat_id(vat_id: &str) -> String {
    vat_id.trim().replace(' ', "")
}

pub const VIES_URL: &str = "https://ec.europa.eu/taxation_customs/vies/services/checkVatService";

const VIES_CACHE_TTL: time::Duration = time::Duration::hours(8);

/// VIES SOAP client with an in-process result cache
#[derive(Clone)]
pub struct ViesClient {
    http: reqwest::Client,
    url: String,
    cache: Arc<RwLock<HashMap<String, (bool, OffsetDateTime)>>>,
}

impl ViesClient {
    pub fn new(url: impl Into<String>) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build VIES client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn envelope(vat_id: &str) -> Option<String> {
        if vat_id.len() < 3 || !vat_id.is_char_boundary(2) {
            return None;
        }
        let (country, number) = vat_id.split_at(2);

        Some(format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Header/>
<soapenv:Body>
  <checkVat xmlns="urn:ec.europa.eu:taxud:vies:services:checkVat:types">
    <countryCode>{}</countryCode>
    <vatNumber>{}</vatNumber>
  </checkVat>
</soapenv:Body>
</soapenv:Envelope>"#,
            country, number
        ))
    }

    async fn check_remote(&self, vat_id: &str) -> bool {
        let Some(envelope) = Self::envelope(vat_id) else {
            return false;
        };

        let response = match self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "VIES request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "VIES returned an error status");
            return false;
        }

        match response.text().await {
            Ok(body) => parse_valid_flag(&body),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read VIES response");
                false
            }
        }
    }
}

/// Read the `valid` element of a `checkVatResponse`, whatever its namespace prefix
fn parse_valid_flag(body: &str) -> bool {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut in_valid = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => in_valid = element.local_name().as_ref() == b"valid",
            Ok(Event::Text(text)) if in_valid => {
                return text
                    .unescape()
                    .map(|value| value.trim() == "true")
                    .unwrap_or(false);
            }
            Ok(Event::End(_)) => in_valid = false,
            Ok(Event::Eof) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed VIES response");
                return false;
            }
            Ok(_) => {}
        }
    }
}

#[async_trait]
impl VatIdVerifier for ViesClient {
    async fn verify(&self, vat_id: &str) -> bool {
        let vat_id = sanitize_vat_id(vat_id);
        let now = OffsetDateTime::now_utc();

        if let Some((valid, checked_at)) = self.cache.read().await.get(&vat_id) {
            if now - *checked_at < VIES_CACHE_TTL {
                return *valid;
            }
        }

        let valid = self.check_remote(&vat_id).await;
        self.cache.write().await.insert(vat_id.clone(), (valid, now));

        tracing::info!(vat_id = %vat_id, valid = valid, "Checked VAT ID");
        valid
    }
}
