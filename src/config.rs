use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::gateway::GatewaySettings;
use crate::services::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub gateway_api_url: String,
    pub gateway_vault_url: String,
    pub gateway_public_key: String,
    pub gateway_secret_key: String,
    pub gateway_timeout: Duration,
    pub gateway_circuit_failures: u32,
    pub gateway_circuit_reset: Duration,
    pub webhook_secret: String,
    pub default_currency: String,
    pub bank_return_uri: String,
    pub database_url: Option<String>,
    pub sweep_interval: Option<Duration>,
    pub log_format: LogFormat,
    pub log_request_body: bool,
    /// Users created at startup if missing.
    pub seed_users: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let config = Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("SERVER_PORT must be a port number")?,
            gateway_api_url: env::var("GATEWAY_API_URL")
                .unwrap_or_else(|_| "https://api.omise.co".to_string()),
            gateway_vault_url: env::var("GATEWAY_VAULT_URL")
                .unwrap_or_else(|_| "https://vault.omise.co".to_string()),
            gateway_public_key: env::var("GATEWAY_PUBLIC_KEY")
                .context("GATEWAY_PUBLIC_KEY is required")?,
            gateway_secret_key: env::var("GATEWAY_SECRET_KEY")
                .context("GATEWAY_SECRET_KEY is required")?,
            gateway_timeout: Duration::from_secs(parse_or("GATEWAY_TIMEOUT_SECS", 30)?),
            gateway_circuit_failures: parse_or("GATEWAY_CIRCUIT_FAILURES", 3)?,
            gateway_circuit_reset: Duration::from_secs(parse_or("GATEWAY_CIRCUIT_RESET_SECS", 60)?),
            webhook_secret: env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET is required")?,
            default_currency: env::var("DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "thb".to_string())
                .to_lowercase(),
            bank_return_uri: env::var("BANK_RETURN_URI").context("BANK_RETURN_URI is required")?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            sweep_interval: match parse_or::<u64>("SWEEP_INTERVAL_SECS", 0)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            log_request_body: parse_or("LOG_REQUEST_BODY", false)?,
            seed_users: env::var("SEED_USERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }
        if self.gateway_secret_key.is_empty() {
            anyhow::bail!("GATEWAY_SECRET_KEY is empty");
        }
        if self.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET is empty");
        }
        if self.gateway_timeout.is_zero() {
            anyhow::bail!("GATEWAY_TIMEOUT_SECS must be greater than 0");
        }
        if self.default_currency.len() != 3 {
            anyhow::bail!("DEFAULT_CURRENCY must be a three-letter ISO code");
        }

        url::Url::parse(&self.gateway_api_url).context("GATEWAY_API_URL is not a valid URL")?;
        url::Url::parse(&self.gateway_vault_url).context("GATEWAY_VAULT_URL is not a valid URL")?;
        url::Url::parse(&self.bank_return_uri).context("BANK_RETURN_URI is not a valid URL")?;

        Ok(())
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            api_url: self.gateway_api_url.clone(),
            vault_url: self.gateway_vault_url.clone(),
            public_key: self.gateway_public_key.clone(),
            secret_key: self.gateway_secret_key.clone(),
            timeout: self.gateway_timeout,
            failure_threshold: self.gateway_circuit_failures,
            reset_timeout: self.gateway_circuit_reset,
        }
    }

    /// Copy safe to print: keys and secrets are masked.
    pub fn masked(&self) -> Config {
        Config {
            gateway_public_key: mask(&self.gateway_public_key),
            gateway_secret_key: mask(&self.gateway_secret_key),
            webhook_secret: mask(&self.webhook_secret),
            database_url: self.database_url.as_ref().map(|_| "****".to_string()),
            ..self.clone()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_currency: self.default_currency.clone(),
            bank_return_uri: self.bank_return_uri.clone(),
            gateway_timeout: self.gateway_timeout,
        }
    }
}

fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(5).collect();
    format!("{}****", prefix)
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn sample() -> Self {
        Config {
            server_port: 3000,
            gateway_api_url: "https://api.omise.co".to_string(),
            gateway_vault_url: "https://vault.omise.co".to_string(),
            gateway_public_key: "pkey_test".to_string(),
            gateway_secret_key: "skey_test".to_string(),
            gateway_timeout: Duration::from_secs(30),
            gateway_circuit_failures: 3,
            gateway_circuit_reset: Duration::from_secs(60),
            webhook_secret: "whsec_test".to_string(),
            default_currency: "thb".to_string(),
            bank_return_uri: "https://shop.example/orders/complete".to_string(),
            database_url: None,
            sweep_interval: None,
            log_format: LogFormat::Pretty,
            log_request_body: false,
            seed_users: vec!["1".to_string()],
        }
    }
}
