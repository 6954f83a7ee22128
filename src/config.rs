use crate::infrastructure::http::retry::RetryOptions;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub address: String,
    pub namespace: Option<String>,
    pub region: Option<String>,
    pub token: Option<String>,
    pub http_timeout: Duration,
    pub retry: RetryOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup("VARLOCK_ADDR")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://127.0.0.1:4646".to_string());

        if !address.starts_with("http://") && !address.starts_with("https://") {
            return Err(ConfigError::InvalidAddress(address));
        }

        let namespace = lookup("VARLOCK_NAMESPACE").filter(|v| !v.is_empty());
        let region = lookup("VARLOCK_REGION").filter(|v| !v.is_empty());
        let token = lookup("VARLOCK_TOKEN").filter(|v| !v.is_empty());

        let http_timeout =
            Duration::from_secs(parse_number(&lookup, "VARLOCK_HTTP_TIMEOUT_SECS")?.unwrap_or(30));

        let defaults = RetryOptions::default();
        let retry = RetryOptions {
            max_retries: parse_number::<_, u32>(&lookup, "VARLOCK_MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            delay_base: parse_number(&lookup, "VARLOCK_RETRY_DELAY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay_base),
            fixed_delay: None,
            max_backoff_delay: parse_number(&lookup, "VARLOCK_MAX_BACKOFF_MS")?
                .map(Duration::from_millis),
            max_to_last_call: parse_number(&lookup, "VARLOCK_MAX_TO_LAST_CALL_MS")?
                .map(Duration::from_millis),
        };

        Ok(Config {
            address,
            namespace,
            region,
            token,
            http_timeout,
            retry,
        })
    }
}

fn parse_number<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VARLOCK_ADDR must be an http(s) URL, got {0}")]
    InvalidAddress(String),

    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}
