//! Runtime configuration, read from the environment (and `.env` via dotenvy).
//!
//! Vendor secrets are optional here: a missing key only disables the feature
//! that needs it, and the handler answers "not configured" at request time.

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::models::Tier;

/// OAuth client registration with the identity provider.
#[derive(Clone, Debug, Default)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// HMAC key for the signed `state` parameter.
    pub state_secret: String,
}

#[derive(Clone, Debug, Default)]
pub struct SupabaseConfig {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub service_role_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub premium_price_id: Option<String>,
    /// Tier granted when checkout metadata carries none (or an unknown one).
    pub default_tier: Tier,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub app_url: String,
    pub is_production: bool,
    pub oauth: OAuthConfig,
    /// Inference token used for anonymous visitors.
    pub default_hf_token: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub supabase: SupabaseConfig,
    pub stripe: StripeConfig,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub static_dir: Option<PathBuf>,
}

impl Config {
    /// Load `.env` (if any) and read every key from the process environment.
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            info!("No .env file loaded: {e}");
        }

        let app_url = var("NEXT_PUBLIC_APP_URL")
            .or_else(|| var("APP_URL"))
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        let state_secret = var("OAUTH_STATE_SECRET").unwrap_or_else(|| {
            warn!("OAUTH_STATE_SECRET not set, generating an ephemeral one");
            uuid::Uuid::new_v4().to_string()
        });

        let default_tier = var("STRIPE_DEFAULT_TIER")
            .and_then(|t| Tier::from_name(&t))
            .unwrap_or(Tier::Starter);

        Self {
            bind_addr: var("ILY_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            is_production: var("ILY_ENV").as_deref() == Some("production"),
            oauth: OAuthConfig {
                client_id: var("OAUTH_CLIENT_ID"),
                client_secret: var("OAUTH_CLIENT_SECRET"),
                redirect_uri: var("REDIRECT_URI")
                    .unwrap_or_else(|| format!("{app_url}/api/auth/callback")),
                state_secret,
            },
            default_hf_token: var("DEFAULT_HF_TOKEN"),
            deepseek_api_key: var("DEEPSEEK_API_KEY"),
            supabase: SupabaseConfig {
                url: var("SUPABASE_URL").or_else(|| var("NEXT_PUBLIC_SUPABASE_URL")),
                anon_key: var("SUPABASE_ANON_KEY").or_else(|| var("NEXT_PUBLIC_SUPABASE_ANON_KEY")),
                service_role_key: var("SUPABASE_SERVICE_ROLE_KEY"),
            },
            stripe: StripeConfig {
                secret_key: var("STRIPE_SECRET_KEY"),
                webhook_secret: var("STRIPE_WEBHOOK_SECRET"),
                premium_price_id: var("STRIPE_PREMIUM_PRICE_ID"),
                default_tier,
            },
            data_dir: var("ILY_DATA_DIR").unwrap_or_else(|| "ily_data".to_string()).into(),
            log_dir: var("ILY_LOG_DIR").unwrap_or_else(|| "logs".to_string()).into(),
            static_dir: var("ILY_STATIC_DIR").map(PathBuf::from),
            app_url,
        }
    }

    /// Settings for tests: no vendor keys, throwaway directories.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            app_url: "http://localhost:3000".to_string(),
            is_production: false,
            oauth: OAuthConfig {
                client_id: Some("client-id".to_string()),
                client_secret: Some("client-secret".to_string()),
                redirect_uri: "http://localhost:3000/api/auth/callback".to_string(),
                state_secret: "test-state-secret".to_string(),
            },
            default_hf_token: Some("hf_default".to_string()),
            deepseek_api_key: Some("sk-deepseek".to_string()),
            supabase: SupabaseConfig::default(),
            stripe: StripeConfig {
                secret_key: Some("sk_test".to_string()),
                webhook_secret: Some("whsec_test".to_string()),
                premium_price_id: Some("price_premium".to_string()),
                default_tier: Tier::Starter,
            },
            log_dir: data_dir.join("logs"),
            data_dir,
            static_dir: None,
        }
    }
}

/// Non-empty environment variable, or `None`.
fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
