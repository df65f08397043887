//! Sliding-window rate limiter and admin shared-secret guard.
//! Keyed by (client identifier, endpoint category); mutating endpoints are
//! additionally gated by a shared secret unless the process runs in
//! developer mode.

use crate::config::{RateLimitSetting, ServiceConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Default,
    Analyze,
    Verify,
    Scan,
}

pub struct RateLimiter {
    settings: HashMap<Category, RateLimitSetting>,
    windows: Mutex<HashMap<(String, Category), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut settings = HashMap::new();
        settings.insert(Category::Default, config.rate_limit_default.clone());
        settings.insert(Category::Analyze, config.rate_limit_analyze.clone());
        settings.insert(Category::Verify, config.rate_limit_verify.clone());
        settings.insert(Category::Scan, config.rate_limit_scan.clone());
        Self { settings, windows: Mutex::new(HashMap::new()) }
    }

    /// Records a request attempt for `(client_id, category)` and returns
    /// `Ok(())` if it's within the configured window, or
    /// `Err(Error::RateLimited)` with the seconds remaining otherwise.
    pub fn check(&self, client_id: &str, category: Category) -> Result<()> {
        let setting = self.settings.get(&category).copied().unwrap_or_default();
        let now = Instant::now();
        let window = setting.window;

        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let key = (client_id.to_string(), category);
        let entries = windows.entry(key).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() as u32 >= setting.max_requests {
            let oldest = entries.first().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Err(Error::RateLimited { retry_after_secs: retry_after.as_secs().max(1) });
        }

        entries.push(now);
        Ok(())
    }
}

/// Validates the `X-Admin-Secret` header against configured secret,
/// bypassed entirely in developer mode. Rejects before any
/// other work happens on a mutating endpoint.
pub fn guard_admin_secret(config: &ServiceConfig, provided: Option<&str>) -> Result<()> {
    if config.developer_mode {
        return Ok(());
    }
    let expected = config
        .admin_secret
        .as_deref()
        .ok_or_else(|| Error::Internal("admin secret not configured outside developer mode".into()))?;
    match provided {
        Some(p) if constant_time_eq(p.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(Error::Unauthorized("missing or invalid admin shared secret".into())),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
