use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identity-provider userinfo (OpenID Connect claims we care about).
#[derive(Serialize, Deserialize, Debug, Clone, Default, ToSchema)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl UserInfo {
    /// Stable user id: `sub`, falling back to the username.
    pub fn user_id(&self) -> Option<&str> {
        self.sub
            .as_deref()
            .or(self.preferred_username.as_deref())
    }

    /// Display name for logs: username, then full name.
    pub fn display_name(&self) -> Option<&str> {
        self.preferred_username.as_deref().or(self.name.as_deref())
    }
}

/// Usage bracket. Each tier maps to a fixed request ceiling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Starter,
    Pro,
    Unlimited,
}

impl Tier {
    pub fn limit(self) -> u64 {
        match self {
            Tier::Free => 1,
            Tier::Starter => 4,
            Tier::Pro => 40,
            Tier::Unlimited => 999_999,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Unlimited => "unlimited",
        }
    }

    /// Case-insensitive lookup; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "starter" => Some(Tier::Starter),
            "pro" => Some(Tier::Pro),
            "unlimited" => Some(Tier::Unlimited),
            _ => None,
        }
    }
}

/// Row of the `users` table.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_tier: Option<String>,
}

/// Row of the `subscriptions` table. Written only by the payment webhook.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub status: String,
    pub tier: String,
    pub payment_provider: String,
    #[serde(default)]
    pub provider_customer_id: Option<String>,
    #[serde(default)]
    pub provider_subscription_id: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn tier(&self) -> Tier {
        Tier::from_name(&self.tier).unwrap_or_default()
    }
}

/// Row of the `payment_history` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub user_id: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    pub payment_provider: String,
    #[serde(default)]
    pub provider_payment_id: Option<String>,
    /// Major currency units.
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: String,
    pub payment_method: String,
}

/// Usage summary shown by the usage tracker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub used: u64,
    pub limit: u64,
    pub tier: Tier,
    pub reset_at: Option<DateTime<Utc>>,
}

/// One entry of the AI feedback log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub prompt: String,
    pub solution: String,
    pub feedback: String,
}

/// Claims of the signed OAuth `state` parameter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateClaims {
    pub nonce: String,
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_limits_follow_the_lookup_table() {
        assert_eq!(Tier::Free.limit(), 1);
        assert_eq!(Tier::Starter.limit(), 4);
        assert_eq!(Tier::Pro.limit(), 40);
        assert_eq!(Tier::Unlimited.limit(), 999_999);
    }

    #[test]
    fn tier_names_parse_case_insensitively() {
        assert_eq!(Tier::from_name("PRO"), Some(Tier::Pro));
        assert_eq!(Tier::from_name(" Starter "), Some(Tier::Starter));
        assert_eq!(Tier::from_name("premium"), None);
    }

    #[test]
    fn user_id_prefers_subject() {
        let mut info = UserInfo {
            sub: Some("u-1".into()),
            preferred_username: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(info.user_id(), Some("u-1"));
        info.sub = None;
        assert_eq!(info.user_id(), Some("alice"));
    }
}
