use crate::application_impl::SessionConfig;
use crate::domain_model::{MAX_WINDOW_SECS, RateLimitPolicy};
use anyhow::{Result, anyhow, bail};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_SCOPE: &str = "default";
pub const AUTH_SCOPE: &str = "auth";

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub auth: Auth,
    pub http: Http,
    pub log: Log,
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    pub backend: String, // "fake" or "gotrue"
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    pub address: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct RateLimit {
    pub backend: String, // "redis", "memory" or "none"
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub policies: HashMap<String, RateLimitPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct Session {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
        }
    }
}

impl Session {
    pub fn to_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }
}

impl RateLimit {
    pub fn policy(&self, scope: &str) -> Result<RateLimitPolicy> {
        self.policies
            .get(scope)
            .copied()
            .ok_or_else(|| anyhow!("no rate limit policy for scope {:?}", scope))
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_refresh_threshold_secs() -> u64 {
    5 * 60
}

fn default_refresh_timeout_secs() -> u64 {
    10
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        match self.auth.backend.as_str() {
            "fake" => {}
            "gotrue" => {
                if self.auth.url.is_empty() || self.auth.api_key.is_empty() {
                    bail!("auth.url and auth.api_key are required for the gotrue backend");
                }
            }
            other => bail!("Unknown auth backend: {}", other),
        }

        match self.rate_limit.backend.as_str() {
            "memory" | "none" => {}
            "redis" => {
                if self.rate_limit.redis_url.is_none() {
                    bail!("rate_limit.redis_url is required for the redis backend");
                }
            }
            other => bail!("Unknown rate limit backend: {}", other),
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            bail!("rate_limit.sweep_interval_secs must be positive");
        }
        for scope in [DEFAULT_SCOPE, AUTH_SCOPE] {
            self.rate_limit.policy(scope)?;
        }
        for (scope, policy) in &self.rate_limit.policies {
            if !policy.is_valid() {
                bail!(
                    "rate limit policy {:?} needs a positive limit and a window of 1 to {} seconds",
                    scope,
                    MAX_WINDOW_SECS
                );
            }
        }

        let session = &self.session;
        if session.poll_interval_secs == 0
            || session.refresh_threshold_secs == 0
            || session.refresh_timeout_secs == 0
        {
            bail!("session intervals must be positive");
        }

        if self.http.cert_path.is_some() != self.http.key_path.is_some() {
            bail!("http.cert_path and http.key_path must be set together");
        }
        Ok(())
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::with_prefix("TURNSTILE").separator("__"))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    settings.validate()?;
    Ok(settings)
}
