use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{HuggingFaceIdentity, IdentityProvider};
use crate::billing::{PaymentProvider, StripeClient};
use crate::config::Config;
use crate::database::{Database, MemoryDatabase, PostgrestDatabase};
use crate::feedback::FeedbackStore;
use crate::hosting::{HostingProvider, HuggingFaceHub};
use crate::inference::{ChatCompletionsClient, InferenceClient};
use crate::rate_limit::{IpRateLimiter, MeterLocks};

pub const HF_BASE_URL: &str = "https://huggingface.co";
pub const HF_ROUTER_CHAT_URL: &str = "https://router.huggingface.co/v1/chat/completions";
pub const DEEPSEEK_CHAT_URL: &str = "https://api.deepseek.com/chat/completions";

/// Shared handler state: config, vendor clients, and the process-local pieces.
pub struct AppState {
    pub config: Config,
    pub identity: Arc<dyn IdentityProvider>,
    /// Site generation (inference router, per-request token).
    pub generator: Arc<dyn InferenceClient>,
    /// Coaching assistant (DeepSeek, server key).
    pub assistant: Arc<dyn InferenceClient>,
    pub db: Arc<dyn Database>,
    /// `None` when Stripe is not configured.
    pub payments: Option<Arc<dyn PaymentProvider>>,
    pub hosting: Arc<dyn HostingProvider>,
    pub rate_limiter: IpRateLimiter,
    pub metering: MeterLocks,
    pub feedback: FeedbackStore,
}

impl AppState {
    /// Wire production clients from `config`.
    pub fn from_config(config: Config) -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ily_server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let db: Arc<dyn Database> = match (
            config.supabase.url.as_deref(),
            config
                .supabase
                .service_role_key
                .as_deref()
                .or(config.supabase.anon_key.as_deref()),
        ) {
            (Some(url), Some(key)) => {
                info!(url, "Using Supabase database");
                Arc::new(PostgrestDatabase::new(http.clone(), url, key)?)
            }
            _ => {
                warn!("Supabase not configured, using in-memory database (data is lost on restart)");
                Arc::new(MemoryDatabase::new())
            }
        };

        let payments = config.stripe.secret_key.as_deref().map(|key| {
            Arc::new(StripeClient::new(http.clone(), key)) as Arc<dyn PaymentProvider>
        });
        if payments.is_none() {
            warn!("STRIPE_SECRET_KEY not set, billing endpoints are disabled");
        }

        let feedback = FeedbackStore::open(config.data_dir.join("feedback"))?;

        Ok(Arc::new(Self {
            identity: Arc::new(HuggingFaceIdentity::new(http.clone(), HF_BASE_URL)),
            generator: Arc::new(ChatCompletionsClient::new(http.clone(), HF_ROUTER_CHAT_URL)),
            assistant: Arc::new(ChatCompletionsClient::new(http.clone(), DEEPSEEK_CHAT_URL)),
            hosting: Arc::new(HuggingFaceHub::new(http, HF_BASE_URL)),
            rate_limiter: IpRateLimiter::default(),
            metering: MeterLocks::default(),
            db,
            payments,
            feedback,
            config,
        }))
    }
}
