//! Engine and remote configuration.
//!
//! Values come from the environment (`TOURBOOK_*`) with defaults suited to an
//! interactive client. Parsing goes through a lookup function so tests never
//! touch the process environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheConfig;
use crate::models::EntityRegistry;
use crate::sync::BackoffPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for the cache, the retry policy and the sync scheduler
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub backoff: BackoffPolicy,
    /// Upper bound for any single remote call
    pub request_timeout: Duration,
    /// Timer-driven sync period; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Error entries kept per workspace for status displays
    pub max_reported_errors: usize,
    pub registry: EntityRegistry,
}

impl EngineConfig {
    /// Defaults with the Tourbook entity registry
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            cache: CacheConfig::default(),
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(10),
            sync_interval: Some(Duration::from_secs(30)),
            max_reported_errors: 50,
            registry: EntityRegistry::tourbook_default()
                .map_err(|error| ConfigError::Invalid(error.to_string()))?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new()?;

        if let Some(ttl) = parse_u64(&lookup, "TOURBOOK_CACHE_TTL_MS")? {
            config.cache.ttl = Duration::from_millis(ttl);
        }
        if let Some(capacity) = parse_u64(&lookup, "TOURBOOK_CACHE_CAPACITY")? {
            config.cache.capacity = usize::try_from(capacity).map_err(|_| {
                ConfigError::Invalid("TOURBOOK_CACHE_CAPACITY is too large".to_string())
            })?;
        }
        if let Some(secs) = parse_u64(&lookup, "TOURBOOK_SYNC_INTERVAL_SECS")? {
            config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(timeout) = parse_u64(&lookup, "TOURBOOK_REQUEST_TIMEOUT_MS")? {
            if timeout == 0 {
                return Err(ConfigError::Invalid(
                    "TOURBOOK_REQUEST_TIMEOUT_MS must be > 0".to_string(),
                ));
            }
            config.request_timeout = Duration::from_millis(timeout);
        }
        if let Some(attempts) = parse_u64(&lookup, "TOURBOOK_RETRY_MAX_ATTEMPTS")? {
            config.backoff.max_attempts = u32::try_from(attempts)
                .ok()
                .filter(|attempts| *attempts > 0)
                .ok_or_else(|| {
                    ConfigError::Invalid(
                        "TOURBOOK_RETRY_MAX_ATTEMPTS must be between 1 and 2^32-1".to_string(),
                    )
                })?;
        }
        if let Some(base) = parse_u64(&lookup, "TOURBOOK_RETRY_BASE_MS")? {
            config.backoff.base_delay = Duration::from_millis(base);
        }
        if let Some(max) = parse_u64(&lookup, "TOURBOOK_RETRY_MAX_MS")? {
            config.backoff.max_delay = Duration::from_millis(max);
        }
        if config.backoff.max_delay < config.backoff.base_delay {
            return Err(ConfigError::Invalid(
                "TOURBOOK_RETRY_MAX_MS must be >= TOURBOOK_RETRY_BASE_MS".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Where the remote store lives and how to authenticate
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_token: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field(
                "api_token",
                &self.api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let base_url = base_url.into();
        let base_url = trim_trailing(base_url.trim()).to_string();
        if !is_http_url(&base_url) {
            return Err(ConfigError::Invalid(
                "TOURBOOK_REMOTE_URL must start with http:// or https://".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            api_token: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api_token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = required_trimmed(&lookup, "TOURBOOK_REMOTE_URL")?;
        Ok(Self::new(base_url)?.with_token(optional_trimmed(&lookup, "TOURBOOK_API_TOKEN")))
    }
}

fn parse_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u64>, ConfigError> {
    optional_trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}
