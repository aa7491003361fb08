//! Process configuration, read once at startup and immutable afterwards.

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{0} must be {1}")]
    Invalid(&'static str, &'static str),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub admin_api_key: String,
    /// 32 raw bytes, parsed from 64 hex chars.
    pub secrets_encryption_key: [u8; 32],
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub database_url: Option<String>,
    pub max_batch_size: usize,
    pub jwt_ttl_seconds: i64,
    pub bind_addr: String,
    pub port: u16,
    pub pricing_poll_interval: Duration,
    pub pricing_batch_size: usize,
    pub pricing_max_retries: i32,
    pub wallet_sweep_interval: Duration,
    pub period_close_interval: Duration,
    pub jti_sweep_interval: Duration,
    pub webhook_tolerance: Duration,
    pub public_base_url: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_api_key = require("ADMIN_API_KEY")?;
        let key_hex = require("SECRETS_ENCRYPTION_KEY")?;
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|_| ConfigError::Invalid("SECRETS_ENCRYPTION_KEY", "hex"))?;
        let secrets_encryption_key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("SECRETS_ENCRYPTION_KEY", "32 bytes of hex"))?;

        let public_base_url =
            env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into());

        Ok(Self {
            admin_api_key,
            secrets_encryption_key,
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            database_url: optional("DATABASE_URL"),
            max_batch_size: parsed("MAX_BATCH_SIZE", 1000)?,
            jwt_ttl_seconds: parsed("JWT_TTL_SECONDS", 60)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("PORT", 8080)?,
            pricing_poll_interval: Duration::from_secs(parsed("PRICING_POLL_INTERVAL_SECS", 5)?),
            pricing_batch_size: parsed("PRICING_BATCH_SIZE", 50)?,
            pricing_max_retries: parsed("PRICING_MAX_RETRIES", 5)?,
            wallet_sweep_interval: Duration::from_secs(parsed("WALLET_SWEEP_INTERVAL_SECS", 300)?),
            period_close_interval: Duration::from_secs(parsed(
                "PERIOD_CLOSE_INTERVAL_SECS",
                86_400,
            )?),
            jti_sweep_interval: Duration::from_secs(parsed("JTI_SWEEP_INTERVAL_SECS", 3_600)?),
            webhook_tolerance: Duration::from_secs(parsed("WEBHOOK_TOLERANCE_SECS", 300)?),
            checkout_success_url: env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| format!("{public_base_url}/billing/success")),
            checkout_cancel_url: env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| format!("{public_base_url}/billing/cancel")),
            portal_return_url: env::var("PORTAL_RETURN_URL")
                .unwrap_or_else(|_| format!("{public_base_url}/billing")),
            public_base_url,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "a number")),
        Err(_) => Ok(default),
    }
}
