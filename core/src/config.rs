use crate::rate_governor::RatePolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default User-Agent sent on every partner call.
pub const DEFAULT_USER_AGENT: &str = "ASHER";
pub const DEFAULT_DB_PATH: &str = "batch_processing.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// First hour (local time) of the business-hours ceiling.
    pub peak_start_hour: u32,
    /// Hour (local time) at which the off-peak ceiling resumes.
    pub peak_end_hour: u32,
    pub peak_ceiling: u32,
    pub off_peak_ceiling: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            peak_start_hour: 7,
            peak_end_hour: 20,
            peak_ceiling: 100,
            off_peak_ceiling: 2000,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self) -> RatePolicy {
        RatePolicy {
            peak_start_hour: self.peak_start_hour,
            peak_end_hour: self.peak_end_hour,
            peak_ceiling: self.peak_ceiling,
            off_peak_ceiling: self.off_peak_ceiling,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Full URL of the token endpoint (`{auth_base}/token`).
    pub auth_url: String,
    /// Partner API base, without trailing slash.
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_user_agent() -> String { DEFAULT_USER_AGENT.to_string() }
fn default_batch_size() -> usize { 5000 }
fn default_max_workers() -> usize { 5 }
fn default_max_auth_retries() -> u32 { 2 }
fn default_timeout_secs() -> u64 { 30 }
fn default_db_path() -> String { DEFAULT_DB_PATH.to_string() }

/// Production defaults with no endpoints or credentials set.
impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: default_user_agent(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            max_auth_retries: default_max_auth_retries(),
            request_timeout_secs: default_timeout_secs(),
            db_path: default_db_path(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EnrichConfig {
    /// Load from a JSON file, then overlay environment variables.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        Self::load_with(path, |k| std::env::var(k).ok())
    }

    fn load_with(path: &str, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {path}"))?;
        let mut config: EnrichConfig = serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse {path}"))?;
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Build from the defaults plus the environment (`URL_TOKEN`,
    /// `BASE_URL`, `PARTNER_USER`, `PARTNER_PASSWORD`).
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Overlay values found through `lookup`; absent keys keep the
    /// current value. Credentials use the `PARTNER_` prefix so the
    /// shell's own `USER` never replaces the configured login.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("URL_TOKEN")        { self.auth_url = v; }
        if let Some(v) = lookup("BASE_URL")         { self.base_url = v; }
        if let Some(v) = lookup("PARTNER_USER")     { self.username = v; }
        if let Some(v) = lookup("PARTNER_PASSWORD") { self.password = v; }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.auth_url.is_empty(), "auth_url is not set (URL_TOKEN)");
        anyhow::ensure!(!self.base_url.is_empty(), "base_url is not set (BASE_URL)");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.max_workers > 0, "max_workers must be > 0");
        anyhow::ensure!(
            self.rate_limit.peak_ceiling > 0 && self.rate_limit.off_peak_ceiling > 0,
            "rate limit ceilings must be > 0"
        );
        anyhow::ensure!(self.rate_limit.window_secs > 0, "rate limit window must be > 0");
        anyhow::ensure!(
            self.rate_limit.peak_start_hour < 24 && self.rate_limit.peak_end_hour <= 24,
            "rate limit hours must be within 0..=24"
        );
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            auth_url: "http://partner.test/token".into(),
            base_url: "http://partner.test".into(),
            username: "test-user".into(),
            password: "test-password".into(),
            user_agent: default_user_agent(),
            batch_size: 2,
            max_workers: 2,
            max_auth_retries: default_max_auth_retries(),
            request_timeout_secs: 5,
            db_path: ":memory:".into(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
