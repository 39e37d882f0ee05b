use std::time::Duration;

use serde::Deserialize;

use crate::middleware::rate_limit::RateRule;

const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreBackend,
    pub database_url: String,
    /// Shared secret clients send as `X-API-Key`.
    pub api_key: String,
    pub admin_key: Option<String>,
    /// When false, keys are accepted from any hardware and never bound.
    pub hwid_binding: bool,
    pub sweep_interval: Duration,
    /// Post a notification even when a sweep removed nothing.
    pub sweep_notify_empty: bool,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_secret: Option<String>,
    /// Per-caller limits on the validation routes.
    pub rate_limits: Vec<RateRule>,
}

impl Config {
    /// Returns the admin key for API authentication.
    /// Falls back to api_key if KEYGATE_ADMIN_KEY is not set.
    pub fn admin_key(&self) -> &str {
        self.admin_key.as_deref().unwrap_or(&self.api_key)
    }

    /// Configuration for tests and local experiments: memory store, no
    /// webhook, default limits.
    pub fn for_testing(api_key: &str) -> Self {
        Self {
            port: 0,
            store: StoreBackend::Memory,
            database_url: String::new(),
            api_key: api_key.to_string(),
            admin_key: None,
            hwid_binding: true,
            sweep_interval: Duration::from_secs(3600),
            sweep_notify_empty: true,
            notify_webhook_url: None,
            notify_webhook_secret: None,
            rate_limits: RateRule::defaults(),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|name| std::env::var(name).ok())
}

/// Build the configuration from an arbitrary variable source.
pub fn from_lookup<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = var("KEYGATE_API_KEY").unwrap_or_else(|| PLACEHOLDER_API_KEY.into());

    if api_key == PLACEHOLDER_API_KEY {
        let env_mode = var("KEYGATE_ENV")
            .or_else(|| var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "KEYGATE_API_KEY is still the insecure placeholder. \
                 Set a proper secret before running in production."
            );
        }
        tracing::warn!("KEYGATE_API_KEY is not set — using insecure placeholder");
    }

    let store = match var("KEYGATE_STORE").as_deref().map(str::trim) {
        None | Some("") | Some("postgres") => StoreBackend::Postgres,
        Some("memory") => StoreBackend::Memory,
        Some(other) => anyhow::bail!("unknown KEYGATE_STORE '{}': expected postgres or memory", other),
    };

    let rate_limits = match var("KEYGATE_RATE_LIMITS") {
        Some(rules) => RateRule::parse_list(&rules)?,
        None => RateRule::defaults(),
    };

    Ok(Config {
        port: var("KEYGATE_PORT")
            .or_else(|| var("PORT"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000),
        store,
        database_url: var("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/keygate".into()),
        api_key,
        admin_key: var("KEYGATE_ADMIN_KEY").filter(|s| !s.is_empty()),
        hwid_binding: parse_bool(var("KEYGATE_HWID_BINDING"), true),
        sweep_interval: Duration::from_secs(
            var("KEYGATE_SWEEP_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(3600),
        ),
        sweep_notify_empty: parse_bool(var("KEYGATE_SWEEP_NOTIFY_EMPTY"), true),
        notify_webhook_url: var("KEYGATE_NOTIFY_WEBHOOK_URL").filter(|s| !s.is_empty()),
        notify_webhook_secret: var("KEYGATE_NOTIFY_WEBHOOK_SECRET").filter(|s| !s.is_empty()),
        rate_limits,
    })
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
