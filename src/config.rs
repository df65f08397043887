//! Startup configuration. A single `ServiceConfig` loaded once
//! from environment variables (with `.env` support for local development via
//! `dotenvy`), covering every environment input the HTTP surface and its
//! collaborators need. No hot reload.

use crate::error::{Error, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub developer_mode: bool,
    pub allowed_origins: Vec<String>,
    pub admin_secret: Option<String>,

    pub bind_addr: String,
    pub database_path: String,
    pub vector_store_path: String,
    pub taxonomy_path: String,
    pub exemplar_corpus_path: String,

    pub lm_endpoint: Option<String>,
    pub lm_model_name: String,
    pub lm_timeout: Duration,

    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    pub ssh_discovery_budget: Duration,

    pub ise_endpoint: Option<String>,

    pub rate_limit_default: RateLimitSetting,
    pub rate_limit_analyze: RateLimitSetting,
    pub rate_limit_verify: RateLimitSetting,
    pub rate_limit_scan: RateLimitSetting,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSetting {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitSetting {
    fn default() -> Self {
        RateLimitSetting { max_requests: 60, window: Duration::from_secs(60) }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_var(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn rate_limit(prefix: &str, default_max: u32, default_window_secs: u64) -> RateLimitSetting {
    RateLimitSetting {
        max_requests: env_u32(&format!("{prefix}_MAX"), default_max),
        window: Duration::from_secs(env_u64(&format!("{prefix}_WINDOW_SECS"), default_window_secs)),
    }
}

impl ServiceConfig {
    /// Loads from the process environment, applying `.env` first if present.
    /// Missing required variables outside developer mode is a fatal startup
    /// error, matching the taxonomy's own fail-fast posture.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let developer_mode = env_bool("DEVELOPER_MODE", false);
        let admin_secret = env_var("ADMIN_SHARED_SECRET");

        if !developer_mode && admin_secret.is_none() {
            return Err(Error::Internal(
                "ADMIN_SHARED_SECRET is required when DEVELOPER_MODE is not set".into(),
            ));
        }

        let allowed_origins = env_var("ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Ok(ServiceConfig {
            developer_mode,
            allowed_origins,
            admin_secret,
            bind_addr: env_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_path: env_var("DATABASE_PATH").unwrap_or_else(|| "./data/vulnerabilities.db".to_string()),
            vector_store_path: env_var("VECTOR_STORE_PATH").unwrap_or_else(|| "./data/exemplars.db".to_string()),
            taxonomy_path: env_var("TAXONOMY_PATH").unwrap_or_else(|| "./data/taxonomy".to_string()),
            exemplar_corpus_path: env_var("EXEMPLAR_CORPUS_PATH").unwrap_or_else(|| "./data/exemplars.jsonl".to_string()),
            lm_endpoint: env_var("LM_ENDPOINT"),
            lm_model_name: env_var("LM_MODEL_NAME").unwrap_or_else(|| "default-model".to_string()),
            lm_timeout: Duration::from_secs(env_u64("LM_TIMEOUT_SECS", 30)),
            ssh_connect_timeout: Duration::from_secs(env_u64("SSH_CONNECT_TIMEOUT_SECS", 10)),
            ssh_command_timeout: Duration::from_secs(env_u64("SSH_COMMAND_TIMEOUT_SECS", 15)),
            ssh_discovery_budget: Duration::from_secs(env_u64("SSH_DISCOVERY_BUDGET_SECS", 60)),
            ise_endpoint: env_var("ISE_ENDPOINT"),
            rate_limit_default: rate_limit("RATE_LIMIT_DEFAULT", 120, 60),
            rate_limit_analyze: rate_limit("RATE_LIMIT_ANALYZE", 30, 60),
            rate_limit_verify: rate_limit("RATE_LIMIT_VERIFY", 30, 60),
            rate_limit_scan: rate_limit("RATE_LIMIT_SCAN", 60, 60),
        })
    }

    pub fn requires_admin_secret(&self) -> bool {
        !self.developer_mode
    }

    /// A fully-populated config for tests that need a `ServiceConfig` but
    /// don't want to touch process environment state.
    #[cfg(test)]
    pub fn test_default() -> Self {
        ServiceConfig {
            developer_mode: true,
            allowed_origins: Vec::new(),
            admin_secret: None,
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            vector_store_path: ":memory:".to_string(),
            taxonomy_path: "./data/taxonomy".to_string(),
            exemplar_corpus_path: "./data/exemplars.jsonl".to_string(),
            lm_endpoint: None,
            lm_model_name: "default-model".to_string(),
            lm_timeout: Duration::from_secs(30),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_command_timeout: Duration::from_secs(15),
            ssh_discovery_budget: Duration::from_secs(60),
            ise_endpoint: None,
            rate_limit_default: RateLimitSetting::default(),
            rate_limit_analyze: RateLimitSetting::default(),
            rate_limit_verify: RateLimitSetting::default(),
            rate_limit_scan: RateLimitSetting::default(),
        }
    }
}
