//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and passed into core services as
//! `Arc<CoreConfig>`. Request handling never reads environment variables; the
//! `*_from_env_value` helpers here only parse values the binary has already read.

use crate::constants::{
    CLAIMS_DIR_NAME, CONSENTS_DIR_NAME, DEFAULT_DOMAIN, DEFAULT_RETRY_INITIAL_BACKOFF_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_SEARCH_WINDOW_SECS,
    DEFAULT_SETTLED_RETENTION_SECS, DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_TRANSACTION_TTL_SECS,
    DEFAULT_TTL_SECS, TICKETS_DIR_NAME, TRANSACTIONS_DIR_NAME,
};
use crate::{GatewayError, GatewayResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uhi_codec::MAX_TTL_SECS;

/// Bounded exponential backoff for outbound delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the wait after the first failure is
    /// `backoff_for(1)`).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    subscriber_id: String,
    subscriber_uri: String,
    domain: String,
    data_dir: Option<PathBuf>,
    default_ttl: Duration,
    search_window: Duration,
    transaction_ttl: Duration,
    sweep_interval: Duration,
    settled_retention: Duration,
    retry: RetryPolicy,
    gateway_uri: Option<String>,
    claims_exchange_uri: Option<String>,
}

impl CoreConfig {
    /// Create a new `CoreConfig` for the participant `subscriber_id` reachable at
    /// `subscriber_uri`. Every other setting starts at its default.
    pub fn new(subscriber_id: String, subscriber_uri: String) -> GatewayResult<Self> {
        if subscriber_id.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "subscriber_id cannot be empty".into(),
            ));
        }
        validate_uri("subscriber_uri", &subscriber_uri)?;

        Ok(Self {
            subscriber_id,
            subscriber_uri,
            domain: DEFAULT_DOMAIN.to_owned(),
            data_dir: None,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            search_window: Duration::from_secs(DEFAULT_SEARCH_WINDOW_SECS),
            transaction_ttl: Duration::from_secs(DEFAULT_TRANSACTION_TTL_SECS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            settled_retention: Duration::from_secs(DEFAULT_SETTLED_RETENTION_SECS),
            retry: RetryPolicy::default(),
            gateway_uri: None,
            claims_exchange_uri: None,
        })
    }

    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = Some(data_dir);
        self
    }

    pub fn with_domain(mut self, domain: String) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> GatewayResult<Self> {
        if ttl.as_secs() == 0 {
            return Err(GatewayError::InvalidInput(
                "default TTL must be at least one second".into(),
            ));
        }
        if ttl.as_secs() > MAX_TTL_SECS.unsigned_abs() {
            return Err(GatewayError::InvalidInput(format!(
                "default TTL must be at most {MAX_TTL_SECS} seconds"
            )));
        }
        self.default_ttl = ttl;
        Ok(self)
    }

    pub fn with_search_window(mut self, window: Duration) -> Self {
        self.search_window = window;
        self
    }

    pub fn with_transaction_ttl(mut self, ttl: Duration) -> Self {
        self.transaction_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_settled_retention(mut self, retention: Duration) -> Self {
        self.settled_retention = retention;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_gateway_uri(mut self, uri: String) -> GatewayResult<Self> {
        validate_uri("gateway_uri", &uri)?;
        self.gateway_uri = Some(uri);
        Ok(self)
    }

    pub fn with_claims_exchange_uri(mut self, uri: String) -> GatewayResult<Self> {
        validate_uri("claims_exchange_uri", &uri)?;
        self.claims_exchange_uri = Some(uri);
        Ok(self)
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn subscriber_uri(&self) -> &str {
        &self.subscriber_uri
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn consents_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(CONSENTS_DIR_NAME))
    }

    pub fn tickets_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(TICKETS_DIR_NAME))
    }

    pub fn transactions_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(TRANSACTIONS_DIR_NAME))
    }

    pub fn claims_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(CLAIMS_DIR_NAME))
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn search_window(&self) -> Duration {
        self.search_window
    }

    pub fn transaction_ttl(&self) -> Duration {
        self.transaction_ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn settled_retention(&self) -> Duration {
        self.settled_retention
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn gateway_uri(&self) -> Option<&str> {
        self.gateway_uri.as_deref()
    }

    pub fn claims_exchange_uri(&self) -> Option<&str> {
        self.claims_exchange_uri.as_deref()
    }
}

fn validate_uri(field: &str, uri: &str) -> GatewayResult<()> {
    match url::Url::parse(uri) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(_) | Err(_) => Err(GatewayError::InvalidInput(format!(
            "{field} must be an http(s) URL, got '{uri}'"
        ))),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn u64_from_env_value(name: &str, value: Option<String>, default: u64) -> GatewayResult<u64> {
    non_blank(value)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                GatewayError::InvalidInput(format!("{name} must be a non-negative integer, got '{v}'"))
            })
        })
        .transpose()
        .map(|parsed| parsed.unwrap_or(default))
}

/// Parse a whole number of seconds. Absent or blank values yield `default_secs`.
pub fn duration_secs_from_env_value(
    name: &str,
    value: Option<String>,
    default_secs: u64,
) -> GatewayResult<Duration> {
    u64_from_env_value(name, value, default_secs).map(Duration::from_secs)
}

/// Parse a whole number of milliseconds. Absent or blank values yield `default_ms`.
pub fn duration_millis_from_env_value(
    name: &str,
    value: Option<String>,
    default_ms: u64,
) -> GatewayResult<Duration> {
    u64_from_env_value(name, value, default_ms).map(Duration::from_millis)
}

/// Parse a `u32`. Absent or blank values yield `default`.
pub fn u32_from_env_value(name: &str, value: Option<String>, default: u32) -> GatewayResult<u32> {
    let parsed = u64_from_env_value(name, value, u64::from(default))?;
    u32::try_from(parsed)
        .map_err(|_| GatewayError::InvalidInput(format!("{name} is out of range: {parsed}")))
}
