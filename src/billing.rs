//! Payments, subscriptions, and usage metering.
//!
//! Stripe owns payment correctness; this module starts checkout and portal
//! sessions, verifies webhook deliveries, and mirrors completed checkouts into
//! the `subscriptions`/`users`/`payment_history` tables.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::database::{Database, STRIPE};
use crate::error::{AppError, AppResult};
use crate::models::{PaymentRecord, Subscription, Tier, UsageSummary, UserRecord};

const STRIPE_API: &str = "https://api.stripe.com/v1";
/// Maximum age of a webhook signature timestamp.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;
/// Length of the access window a one-time payment buys.
pub const PAID_PERIOD_HOURS: i64 = 4;

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Used/limit for a user: an active subscription counts usage inside its
/// current period, otherwise (none, or the period has lapsed) the free tier
/// counts all-time usage.
pub async fn usage_summary(db: &dyn Database, user_id: &str) -> AppResult<UsageSummary> {
    let now = Utc::now();
    let current = db
        .active_subscription(user_id)
        .await?
        .filter(|s| s.current_period_end > now);
    match current {
        Some(subscription) => {
            let tier = subscription.tier();
            let used = db
                .count_usage(user_id, Some(subscription.current_period_start))
                .await?;
            Ok(UsageSummary {
                used,
                limit: tier.limit(),
                tier,
                reset_at: Some(subscription.current_period_end),
            })
        }
        None => Ok(UsageSummary {
            used: db.count_usage(user_id, None).await?,
            limit: Tier::Free.limit(),
            tier: Tier::Free,
            reset_at: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// Stripe API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub user_id: String,
    pub tier: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PortalSession {
    pub url: String,
}

/// Subset of a Stripe subscription object shown on the billing page.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderSubscription {
    pub id: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<CheckoutSession>;
    async fn create_portal(&self, customer_id: &str, return_url: &str) -> AppResult<PortalSession>;
    async fn latest_subscription(&self, customer_id: &str) -> AppResult<Option<ProviderSubscription>>;
}

pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, secret_key: impl Into<String>) -> Self {
        Self {
            http,
            secret_key: secret_key.into(),
            base_url: STRIPE_API.to_string(),
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> AppResult<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await?;
        stripe_json(response).await
    }
}

async fn stripe_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or_default();
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("Stripe request failed")
            .to_string();
        warn!(%status, error = %message, "Stripe API error");
        return Err(AppError::Upstream(message));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<CheckoutSession> {
        let mut form = vec![
            ("payment_method_types[0]", "card"),
            ("billing_address_collection", "auto"),
            ("line_items[0][price]", request.price_id.as_str()),
            ("line_items[0][quantity]", "1"),
            ("mode", "payment"),
            ("success_url", request.success_url.as_str()),
            ("cancel_url", request.cancel_url.as_str()),
            ("metadata[userId]", request.user_id.as_str()),
            ("metadata[tier]", request.tier.as_str()),
        ];
        if let Some(email) = request.customer_email.as_deref() {
            form.push(("customer_email", email));
        }
        self.post_form("/checkout/sessions", &form).await
    }

    async fn create_portal(&self, customer_id: &str, return_url: &str) -> AppResult<PortalSession> {
        self.post_form(
            "/billing_portal/sessions",
            &[("customer", customer_id), ("return_url", return_url)],
        )
        .await
    }

    async fn latest_subscription(&self, customer_id: &str) -> AppResult<Option<ProviderSubscription>> {
        let response = self
            .http
            .get(format!("{}/subscriptions", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(&[("customer", customer_id), ("status", "all"), ("limit", "1")])
            .send()
            .await?;
        let list: ListResponse<ProviderSubscription> = stripe_json(response).await?;
        Ok(list.data.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Malformed signature header")]
    Malformed,
    #[error("Signature timestamp outside tolerance")]
    Expired,
    #[error("No signatures found matching the expected signature for payload")]
    Mismatch,
}

fn signed_mac(secret: &str, timestamp: i64, payload: &str) -> Result<Hmac<Sha256>, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Header value Stripe would send for `payload` at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> Result<String, SignatureError> {
    let digest = signed_mac(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
}

/// Check a `Stripe-Signature` header (`t=...,v1=...[,v1=...]`) against the raw body.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", sig)) => candidates.push(sig),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        return Err(SignatureError::Expired);
    }

    let mac = signed_mac(secret, timestamp, payload)?;
    let matched = candidates.iter().any(|sig| {
        hex::decode(sig)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: Value,
}

/// Fields of a completed checkout session we mirror locally.
#[derive(Debug, Default, Deserialize)]
pub struct CompletedCheckout {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutMetadata {
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum WebhookOutcome {
    SubscriptionActivated { user_id: String, tier: Tier },
    PaymentSucceeded(String),
    Skipped(&'static str),
    Ignored(String),
}

/// Dispatch a verified event. Data problems are logged and skipped rather than
/// failing the delivery.
pub async fn handle_event(
    db: &dyn Database,
    event: WebhookEvent,
    default_tier: Tier,
    now: DateTime<Utc>,
) -> AppResult<WebhookOutcome> {
    match event.kind.as_str() {
        "checkout.session.completed" => {
            let session: CompletedCheckout = serde_json::from_value(event.data.object)?;
            checkout_completed(db, session, default_tier, now).await
        }
        "payment_intent.succeeded" => {
            let id = event.data.object["id"].as_str().unwrap_or_default().to_string();
            info!(payment_intent = %id, "Payment succeeded");
            Ok(WebhookOutcome::PaymentSucceeded(id))
        }
        other => Ok(WebhookOutcome::Ignored(other.to_string())),
    }
}

async fn checkout_completed(
    db: &dyn Database,
    session: CompletedCheckout,
    default_tier: Tier,
    now: DateTime<Utc>,
) -> AppResult<WebhookOutcome> {
    let Some(user_id) = session.metadata.user_id.clone() else {
        error!(session = %session.id, "No user ID in session metadata");
        return Ok(WebhookOutcome::Skipped("missing user id"));
    };
    if db.find_user(&user_id).await?.is_none() {
        error!(user_id = %user_id, "User not found");
        return Ok(WebhookOutcome::Skipped("unknown user"));
    }

    let tier = session
        .metadata
        .tier
        .as_deref()
        .and_then(Tier::from_name)
        .unwrap_or(default_tier);

    let row = Subscription {
        id: None,
        user_id: user_id.clone(),
        status: "active".to_string(),
        tier: tier.as_str().to_string(),
        payment_provider: STRIPE.to_string(),
        provider_customer_id: session.customer.clone(),
        provider_subscription_id: Some(session.subscription.clone().unwrap_or_else(|| session.id.clone())),
        current_period_start: now,
        current_period_end: now + Duration::hours(PAID_PERIOD_HOURS),
        created_at: None,
        updated_at: Some(now),
    };

    let subscription_id = match db.provider_subscription(&user_id, STRIPE).await? {
        Some(existing) => {
            let id = existing
                .id
                .ok_or_else(|| AppError::Internal("Stored subscription has no id".into()))?;
            db.update_subscription(&id, row).await?;
            id
        }
        None => db
            .insert_subscription(row)
            .await?
            .id
            .unwrap_or_default(),
    };

    db.upsert_user(UserRecord {
        id: user_id.clone(),
        stripe_customer_id: session.customer.clone(),
        subscription_status: Some("active".to_string()),
        subscription_tier: Some(tier.as_str().to_string()),
        ..Default::default()
    })
    .await?;

    db.insert_payment(PaymentRecord {
        user_id: user_id.clone(),
        subscription_id: Some(subscription_id).filter(|id| !id.is_empty()),
        payment_provider: STRIPE.to_string(),
        provider_payment_id: session.payment_intent,
        amount: session.amount_total.unwrap_or(0) as f64 / 100.0,
        currency: session.currency,
        status: "completed".to_string(),
        payment_method: "card".to_string(),
    })
    .await?;

    info!(user_id = %user_id, tier = tier.as_str(), "Subscription activated");
    Ok(WebhookOutcome::SubscriptionActivated { user_id, tier })
}

/// Unix seconds to UTC, for provider timestamps.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
