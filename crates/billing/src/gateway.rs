//! Stripe-compatible payment-gateway surface.
//!
//! The SDK proper stays outside this codebase; what lives here is the event
//! model, webhook signature verification (`t=…,v1=…` over `"{t}.{body}"`),
//! and a thin form-encoded HTTP client for the four calls the billing flows
//! need: customers, checkout sessions, portal sessions, payment intents.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use meterline_shared::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is not configured")]
    Disabled,
    #[error("gateway signature verification failed: {0}")]
    BadSignature(&'static str),
    #[error("gateway request failed: {0}")]
    Http(String),
    #[error("gateway returned an unexpected body: {0}")]
    BadResponse(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Disabled => ServiceError::unavailable("payment gateway not configured"),
            GatewayError::BadSignature(detail) => ServiceError::auth(detail),
            other => {
                tracing::error!(error = %other, "gateway failure");
                ServiceError::internal("payment gateway failure")
            }
        }
    }
}

// ── Event model ───────────────────────────────────────────────────────────────

/// A verified webhook event. `data.object` stays opaque JSON; handlers decode
/// the pieces they need.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: GatewayEventData,
    #[serde(default)]
    pub livemode: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayEventData {
    pub object: Value,
}

// ── Requests & responses ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CreateCustomer {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    Subscription,
    Payment,
}

impl SessionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Subscription => "subscription",
            SessionMode::Payment => "payment",
        }
    }
}

/// Either a catalog price reference or an inline dynamic amount.
#[derive(Clone, Debug)]
pub enum SessionLineItem {
    Price {
        price_id: String,
        quantity: i64,
    },
    Dynamic {
        currency: String,
        unit_amount_minor: i64,
        product_name: String,
        quantity: i64,
    },
}

#[derive(Clone, Debug)]
pub struct CheckoutSessionRequest {
    pub mode: SessionMode,
    pub customer_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub line_items: Vec<SessionLineItem>,
    pub metadata: BTreeMap<String, String>,
    /// Copied onto the payment intent so `payment_intent.succeeded` carries
    /// the same identifiers as the session.
    pub payment_intent_metadata: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewaySession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PaymentIntentRequest {
    pub customer_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub off_session: bool,
    pub confirm: bool,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayPaymentIntent {
    pub id: String,
    pub status: String,
}

// ── The gateway trait ─────────────────────────────────────────────────────────

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, req: CreateCustomer) -> Result<GatewayCustomer, GatewayError>;
    async fn create_checkout_session(
        &self,
        req: CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError>;
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<GatewaySession, GatewayError>;
    async fn create_payment_intent(
        &self,
        req: PaymentIntentRequest,
    ) -> Result<GatewayPaymentIntent, GatewayError>;
}

/// Stands in when `STRIPE_SECRET_KEY` is absent; every call is a 503.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_customer(&self, _: CreateCustomer) -> Result<GatewayCustomer, GatewayError> {
        Err(GatewayError::Disabled)
    }
    async fn create_checkout_session(
        &self,
        _: CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        Err(GatewayError::Disabled)
    }
    async fn create_portal_session(
        &self,
        _: &str,
        _: &str,
    ) -> Result<GatewaySession, GatewayError> {
        Err(GatewayError::Disabled)
    }
    async fn create_payment_intent(
        &self,
        _: PaymentIntentRequest,
    ) -> Result<GatewayPaymentIntent, GatewayError> {
        Err(GatewayError::Disabled)
    }
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct StripeHttpGateway {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeHttpGateway {
    pub fn new(secret_key: String) -> Self {
        Self::with_base(secret_key, DEFAULT_API_BASE.to_owned())
    }

    pub fn with_base(secret_key: String, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
            api_base,
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(format!("{}{path}", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(GatewayError::Http(format!("{status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::BadResponse(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for StripeHttpGateway {
    async fn create_customer(&self, req: CreateCustomer) -> Result<GatewayCustomer, GatewayError> {
        let mut form = vec![("name".to_owned(), req.name)];
        push_metadata(&mut form, "metadata", &req.metadata);
        self.post_form("/customers", &form).await
    }

    async fn create_checkout_session(
        &self,
        req: CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        let mut form = vec![
            ("mode".to_owned(), req.mode.as_str().to_owned()),
            ("customer".to_owned(), req.customer_id),
            ("success_url".to_owned(), req.success_url),
            ("cancel_url".to_owned(), req.cancel_url),
        ];
        for (index, item) in req.line_items.iter().enumerate() {
            let prefix = format!("line_items[{index}]");
            match item {
                SessionLineItem::Price { price_id, quantity } => {
                    form.push((format!("{prefix}[price]"), price_id.clone()));
                    form.push((format!("{prefix}[quantity]"), quantity.to_string()));
                }
                SessionLineItem::Dynamic {
                    currency,
                    unit_amount_minor,
                    product_name,
                    quantity,
                } => {
                    form.push((
                        format!("{prefix}[price_data][currency]"),
                        currency.to_lowercase(),
                    ));
                    form.push((
                        format!("{prefix}[price_data][unit_amount]"),
                        unit_amount_minor.to_string(),
                    ));
                    form.push((
                        format!("{prefix}[price_data][product_data][name]"),
                        product_name.clone(),
                    ));
                    form.push((format!("{prefix}[quantity]"), quantity.to_string()));
                }
            }
        }
        push_metadata(&mut form, "metadata", &req.metadata);
        if let Some(pi_metadata) = &req.payment_intent_metadata {
            push_metadata(&mut form, "payment_intent_data[metadata]", pi_metadata);
        }
        self.post_form("/checkout/sessions", &form).await
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<GatewaySession, GatewayError> {
        let form = vec![
            ("customer".to_owned(), customer_id.to_owned()),
            ("return_url".to_owned(), return_url.to_owned()),
        ];
        self.post_form("/billing_portal/sessions", &form).await
    }

    async fn create_payment_intent(
        &self,
        req: PaymentIntentRequest,
    ) -> Result<GatewayPaymentIntent, GatewayError> {
        let mut form = vec![
            ("customer".to_owned(), req.customer_id),
            ("amount".to_owned(), req.amount_minor.to_string()),
            ("currency".to_owned(), req.currency.to_lowercase()),
            ("off_session".to_owned(), req.off_session.to_string()),
            ("confirm".to_owned(), req.confirm.to_string()),
        ];
        push_metadata(&mut form, "metadata", &req.metadata);
        self.post_form("/payment_intents", &form).await
    }
}

fn push_metadata(
    form: &mut Vec<(String, String)>,
    prefix: &str,
    metadata: &BTreeMap<String, String>,
) {
    for (key, value) in metadata {
        form.push((format!("{prefix}[{key}]"), value.clone()));
    }
}

// ── Webhook signature verification ────────────────────────────────────────────

/// Verifies `Stripe-Signature: t=<unix>,v1=<hmac>` headers against the raw
/// request body.
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: &str, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        body: &str,
        signature_header: &str,
        now_unix: i64,
    ) -> Result<GatewayEvent, GatewayError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<String> = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value.to_owned()),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(GatewayError::BadSignature("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(GatewayError::BadSignature("missing v1 signature"));
        }
        if (now_unix - timestamp).abs() > self.tolerance_secs {
            return Err(GatewayError::BadSignature("timestamp outside tolerance"));
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| GatewayError::BadSignature("bad signing secret"))?;
        mac.update(format!("{timestamp}.{body}").as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        use subtle::ConstantTimeEq;
        let valid = signatures.iter().any(|candidate| {
            candidate.as_bytes().len() == expected.as_bytes().len()
                && candidate.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1
        });
        if !valid {
            return Err(GatewayError::BadSignature("signature mismatch"));
        }

        serde_json::from_str(body).map_err(|e| {
            tracing::warn!(error = %e, "verified webhook body failed to parse");
            GatewayError::BadResponse(e.to_string())
        })
    }

    /// Test helper: produce a valid header for a body.
    pub fn sign(&self, body: &str, now_unix: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key");
        mac.update(format!("{now_unix}.{body}").as_bytes());
        format!("t={now_unix},v1={}", hex::encode(mac.finalize().into_bytes()))
    }
}

// ── Mock ──────────────────────────────────────────────────────────────────────

/// In-memory gateway for tests: canned ids, call counters, optional failure
/// injection.
#[cfg(any(test, feature = "testutils"))]
pub struct MockGateway {
    pub customers_created: std::sync::atomic::AtomicU64,
    pub sessions_created: std::sync::atomic::AtomicU64,
    pub portals_created: std::sync::atomic::AtomicU64,
    pub intents_created: std::sync::atomic::AtomicU64,
    pub last_session: std::sync::Mutex<Option<CheckoutSessionRequest>>,
    pub last_intent: std::sync::Mutex<Option<PaymentIntentRequest>>,
}

#[cfg(any(test, feature = "testutils"))]
impl Default for MockGateway {
    fn default() -> Self {
        Self {
            customers_created: std::sync::atomic::AtomicU64::new(0),
            sessions_created: std::sync::atomic::AtomicU64::new(0),
            portals_created: std::sync::atomic::AtomicU64::new(0),
            intents_created: std::sync::atomic::AtomicU64::new(0),
            last_session: std::sync::Mutex::new(None),
            last_intent: std::sync::Mutex::new(None),
        }
    }
}

#[cfg(any(test, feature = "testutils"))]
impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "testutils"))]
#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_customer(&self, _req: CreateCustomer) -> Result<GatewayCustomer, GatewayError> {
        let n = self
            .customers_created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(GatewayCustomer {
            id: format!("cus_mock_{n}"),
        })
    }

    async fn create_checkout_session(
        &self,
        req: CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        let n = self
            .sessions_created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.last_session.lock().unwrap() = Some(req);
        Ok(GatewaySession {
            id: format!("cs_mock_{n}"),
            url: Some(format!("https://checkout.mock/{n}")),
        })
    }

    async fn create_portal_session(
        &self,
        _customer_id: &str,
        _return_url: &str,
    ) -> Result<GatewaySession, GatewayError> {
        let n = self
            .portals_created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(GatewaySession {
            id: format!("ps_mock_{n}"),
            url: Some(format!("https://portal.mock/{n}")),
        })
    }

    async fn create_payment_intent(
        &self,
        req: PaymentIntentRequest,
    ) -> Result<GatewayPaymentIntent, GatewayError> {
        let n = self
            .intents_created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.last_intent.lock().unwrap() = Some(req);
        Ok(GatewayPaymentIntent {
            id: format!("pi_mock_{n}"),
            status: "succeeded".into(),
        })
    }
}
