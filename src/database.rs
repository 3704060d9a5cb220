//! Relational backend: users, subscriptions, usage logs, payment history.
//!
//! Production talks to Supabase through its PostgREST interface. When no
//! Supabase URL is configured the server falls back to an in-process store,
//! which is also what the tests run against.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{PaymentRecord, Subscription, UserRecord};

pub const STRIPE: &str = "stripe";

#[async_trait]
pub trait Database: Send + Sync {
    async fn find_user(&self, user_id: &str) -> AppResult<Option<UserRecord>>;
    async fn upsert_user(&self, user: UserRecord) -> AppResult<()>;
    /// Most recent active subscription of a user.
    async fn active_subscription(&self, user_id: &str) -> AppResult<Option<Subscription>>;
    /// The user's subscription held with the given payment provider, any status.
    async fn provider_subscription(&self, user_id: &str, provider: &str) -> AppResult<Option<Subscription>>;
    /// Insert and return the stored row (with its id).
    async fn insert_subscription(&self, subscription: Subscription) -> AppResult<Subscription>;
    async fn update_subscription(&self, id: &str, subscription: Subscription) -> AppResult<()>;
    /// Usage rows of a user, optionally only those created at or after `since`.
    async fn count_usage(&self, user_id: &str, since: Option<DateTime<Utc>>) -> AppResult<u64>;
    async fn record_usage(&self, user_id: &str) -> AppResult<()>;
    async fn insert_payment(&self, payment: PaymentRecord) -> AppResult<()>;
}

// ---------------------------------------------------------------------------
// PostgREST (Supabase)
// ---------------------------------------------------------------------------

pub struct PostgrestDatabase {
    http: reqwest::Client,
    rest_url: String,
    headers: HeaderMap,
}

#[derive(Deserialize)]
struct CountRow {
    count: u64,
}

impl PostgrestDatabase {
    /// `key` is sent as both `apikey` and bearer; the service-role key bypasses
    /// row-level security, which webhook writes need.
    pub fn new(http: reqwest::Client, url: &str, key: &str) -> AppResult<Self> {
        let mut headers = HeaderMap::new();
        let invalid = |e: reqwest::header::InvalidHeaderValue| AppError::Internal(format!("Invalid Supabase key: {e}"));
        headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
        );
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            headers,
        })
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> AppResult<Vec<T>> {
        let response = self
            .http
            .get(format!("{}/{table}", self.rest_url))
            .headers(self.headers.clone())
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, row: &T) -> AppResult<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/{table}", self.rest_url))
            .headers(self.headers.clone())
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl Database for PostgrestDatabase {
    async fn find_user(&self, user_id: &str) -> AppResult<Option<UserRecord>> {
        let rows: Vec<UserRecord> = self
            .select("users", &[("id", eq(user_id)), ("limit", "1".into())])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_user(&self, user: UserRecord) -> AppResult<()> {
        self.http
            .post(format!("{}/users", self.rest_url))
            .headers(self.headers.clone())
            .header("Prefer", "resolution=merge-duplicates")
            .json(&user)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn active_subscription(&self, user_id: &str) -> AppResult<Option<Subscription>> {
        let rows: Vec<Subscription> = self
            .select(
                "subscriptions",
                &[
                    ("user_id", eq(user_id)),
                    ("status", eq("active")),
                    ("order", "created_at.desc".into()),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn provider_subscription(&self, user_id: &str, provider: &str) -> AppResult<Option<Subscription>> {
        let rows: Vec<Subscription> = self
            .select(
                "subscriptions",
                &[
                    ("user_id", eq(user_id)),
                    ("payment_provider", eq(provider)),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_subscription(&self, subscription: Subscription) -> AppResult<Subscription> {
        let rows: Vec<Subscription> = self.insert("subscriptions", &subscription).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::Upstream("Subscription insert returned no row".into()))
    }

    async fn update_subscription(&self, id: &str, subscription: Subscription) -> AppResult<()> {
        self.http
            .patch(format!("{}/subscriptions", self.rest_url))
            .headers(self.headers.clone())
            .query(&[("id", eq(id))])
            .json(&subscription)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn count_usage(&self, user_id: &str, since: Option<DateTime<Utc>>) -> AppResult<u64> {
        let mut query = vec![("select", "count".to_string()), ("user_id", eq(user_id))];
        if let Some(since) = since {
            query.push(("created_at", format!("gte.{}", since.to_rfc3339())));
        }
        let rows: Vec<CountRow> = self.select("usage_logs", &query).await?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    async fn record_usage(&self, user_id: &str) -> AppResult<()> {
        self.insert("usage_logs", &json!({ "user_id": user_id })).await?;
        debug!(user_id, "usage recorded");
        Ok(())
    }

    async fn insert_payment(&self, payment: PaymentRecord) -> AppResult<()> {
        self.insert("payment_history", &payment).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    subscriptions: Vec<Subscription>,
    usage: Vec<(String, DateTime<Utc>)>,
    payments: Vec<PaymentRecord>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn payments(&self) -> Vec<PaymentRecord> {
        self.read().payments.clone()
    }

    /// Backdated usage row, for seeding.
    pub fn record_usage_at(&self, user_id: &str, at: DateTime<Utc>) {
        self.write().usage.push((user_id.to_string(), at));
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn find_user(&self, user_id: &str) -> AppResult<Option<UserRecord>> {
        Ok(self.read().users.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: UserRecord) -> AppResult<()> {
        let mut tables = self.write();
        match tables.users.get_mut(&user.id) {
            Some(existing) => {
                // Merge: absent fields keep their stored value.
                existing.email = user.email.or(existing.email.take());
                existing.stripe_customer_id = user.stripe_customer_id.or(existing.stripe_customer_id.take());
                existing.subscription_status = user.subscription_status.or(existing.subscription_status.take());
                existing.subscription_tier = user.subscription_tier.or(existing.subscription_tier.take());
            }
            None => {
                tables.users.insert(user.id.clone(), user);
            }
        }
        Ok(())
    }

    async fn active_subscription(&self, user_id: &str) -> AppResult<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == "active")
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn provider_subscription(&self, user_id: &str, provider: &str) -> AppResult<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.payment_provider == provider)
            .cloned())
    }

    async fn insert_subscription(&self, mut subscription: Subscription) -> AppResult<Subscription> {
        subscription.id = Some(uuid::Uuid::new_v4().to_string());
        subscription.created_at.get_or_insert_with(Utc::now);
        self.write().subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(&self, id: &str, subscription: Subscription) -> AppResult<()> {
        let mut tables = self.write();
        let row = tables
            .subscriptions
            .iter_mut()
            .find(|s| s.id.as_deref() == Some(id))
            .ok_or_else(|| AppError::not_found(format!("Subscription {id} not found")))?;
        let created_at = row.created_at;
        *row = Subscription {
            id: Some(id.to_string()),
            created_at,
            ..subscription
        };
        Ok(())
    }

    async fn count_usage(&self, user_id: &str, since: Option<DateTime<Utc>>) -> AppResult<u64> {
        Ok(self
            .read()
            .usage
            .iter()
            .filter(|(user, at)| user == user_id && since.map_or(true, |s| *at >= s))
            .count() as u64)
    }

    async fn record_usage(&self, user_id: &str) -> AppResult<()> {
        self.record_usage_at(user_id, Utc::now());
        Ok(())
    }

    async fn insert_payment(&self, payment: PaymentRecord) -> AppResult<()> {
        self.write().payments.push(payment);
        Ok(())
    }
}
