//! Per-IP request counter for anonymous generation, and per-user locks that
//! serialize metered generation.
//!
//! Process-local and never reset: counts survive until restart and are not
//! shared between instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::HeaderMap;
use tokio::sync::OwnedMutexGuard;

pub const MAX_REQUESTS_PER_IP: u32 = 4;
const FALLBACK_IP: &str = "0.0.0.0";

pub struct IpRateLimiter {
    limit: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new(MAX_REQUESTS_PER_IP)
    }
}

impl IpRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `ip`; `false` once the count passes the limit.
    pub fn check(&self, ip: &str) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = counts.entry(ip.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count <= self.limit
    }

    pub fn count(&self, ip: &str) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.get(ip).copied().unwrap_or(0)
    }
}

/// One async lock per signed-in user, held from the quota check until the
/// usage row is written.
#[derive(Default)]
pub struct MeterLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MeterLocks {
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// First `x-forwarded-for` hop, then `x-real-ip`, then `0.0.0.0`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    forwarded.or_else(real_ip).unwrap_or(FALLBACK_IP).to_string()
}
