//! Process start-up shared by the server binaries.
//!
//! Environment variables are read here and nowhere else; the resulting configuration is
//! handed to the core as `Arc<CoreConfig>`.

use crate::AppState;
use anyhow::Context as _;
use api_shared::ApiKeys;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use uhi_codec::{KeyId, SigningKeyPair, TrustedKeyRegistry};
use uhi_core::constants::{
    DEFAULT_DATA_DIR, DEFAULT_RETRY_INITIAL_BACKOFF_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
    DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_SEARCH_WINDOW_SECS, DEFAULT_SETTLED_RETENTION_SECS,
    DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_TRANSACTION_TTL_SECS, DEFAULT_TTL_SECS,
};
use uhi_core::{
    duration_millis_from_env_value, duration_secs_from_env_value, u32_from_env_value, CoreConfig,
    Gateway, ReloadSources, RetryPolicy,
};

const DEFAULT_UNIQUE_KEY_ID: &str = "k1";

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn path_var(name: &str) -> Option<PathBuf> {
    var(name).map(PathBuf::from)
}

/// Resolves [`CoreConfig`] from `UHI_*` environment variables.
pub fn config_from_env() -> anyhow::Result<CoreConfig> {
    let subscriber_id = var("UHI_SUBSCRIBER_ID").context("UHI_SUBSCRIBER_ID must be set")?;
    let subscriber_uri = var("UHI_SUBSCRIBER_URI").context("UHI_SUBSCRIBER_URI must be set")?;
    let data_dir = var("UHI_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into());

    let retry = RetryPolicy {
        max_attempts: u32_from_env_value(
            "UHI_RETRY_MAX_ATTEMPTS",
            var("UHI_RETRY_MAX_ATTEMPTS"),
            DEFAULT_RETRY_MAX_ATTEMPTS,
        )?,
        initial_backoff: duration_millis_from_env_value(
            "UHI_RETRY_INITIAL_BACKOFF_MS",
            var("UHI_RETRY_INITIAL_BACKOFF_MS"),
            DEFAULT_RETRY_INITIAL_BACKOFF_MS,
        )?,
        max_backoff: duration_millis_from_env_value(
            "UHI_RETRY_MAX_BACKOFF_MS",
            var("UHI_RETRY_MAX_BACKOFF_MS"),
            DEFAULT_RETRY_MAX_BACKOFF_MS,
        )?,
    };

    let mut config = CoreConfig::new(subscriber_id, subscriber_uri)?
        .with_data_dir(PathBuf::from(data_dir))
        .with_default_ttl(duration_secs_from_env_value(
            "UHI_DEFAULT_TTL_SECS",
            var("UHI_DEFAULT_TTL_SECS"),
            DEFAULT_TTL_SECS,
        )?)?
        .with_search_window(duration_secs_from_env_value(
            "UHI_SEARCH_WINDOW_SECS",
            var("UHI_SEARCH_WINDOW_SECS"),
            DEFAULT_SEARCH_WINDOW_SECS,
        )?)
        .with_transaction_ttl(duration_secs_from_env_value(
            "UHI_TRANSACTION_TTL_SECS",
            var("UHI_TRANSACTION_TTL_SECS"),
            DEFAULT_TRANSACTION_TTL_SECS,
        )?)
        .with_sweep_interval(duration_millis_from_env_value(
            "UHI_SWEEP_INTERVAL_MS",
            var("UHI_SWEEP_INTERVAL_MS"),
            DEFAULT_SWEEP_INTERVAL_MS,
        )?)
        .with_settled_retention(duration_secs_from_env_value(
            "UHI_SETTLED_RETENTION_SECS",
            var("UHI_SETTLED_RETENTION_SECS"),
            DEFAULT_SETTLED_RETENTION_SECS,
        )?)
        .with_retry(retry);
    if let Some(uri) = var("UHI_GATEWAY_URI") {
        config = config.with_gateway_uri(uri)?;
    }
    if let Some(uri) = var("UHI_CLAIMS_EXCHANGE_URI") {
        config = config.with_claims_exchange_uri(uri)?;
    }
    Ok(config)
}

/// Loads the signing key from `UHI_SIGNING_KEY` (base64 seed). Without one an ephemeral
/// key is generated, which counterparties will not trust.
fn signing_key(subscriber_id: &str) -> anyhow::Result<SigningKeyPair> {
    let unique_key_id = var("UHI_UNIQUE_KEY_ID").unwrap_or_else(|| DEFAULT_UNIQUE_KEY_ID.into());
    let key_id = KeyId::new(subscriber_id, unique_key_id)?;
    match var("UHI_SIGNING_KEY") {
        Some(seed) => Ok(SigningKeyPair::from_base64_seed(key_id, &seed)
            .context("UHI_SIGNING_KEY is not a base64 32-byte seed")?),
        None => {
            tracing::warn!(key_id = %key_id, "UHI_SIGNING_KEY not set; using an ephemeral key");
            Ok(SigningKeyPair::generate(key_id))
        }
    }
}

/// Builds the gateway and REST state from the environment, loading every configured
/// registry file once.
pub fn state_from_env() -> anyhow::Result<AppState> {
    let config = Arc::new(config_from_env()?);
    let key = signing_key(config.subscriber_id())?;
    tracing::info!(key_id = %key.key_id(), public_key = %key.public_key_base64(), "signing key loaded");

    let sources = ReloadSources {
        trusted_keys: path_var("UHI_TRUSTED_KEYS_FILE"),
        terminology: path_var("UHI_TERMINOLOGY_FILE"),
        external_references: path_var("UHI_EXTERNAL_REFERENCES_FILE"),
    };
    let gateway = Gateway::builder(config, Arc::new(key))
        .with_trusted_keys(Arc::new(TrustedKeyRegistry::new()))
        .with_reload_sources(sources)
        .build()?;
    gateway.reload()?;

    let api_keys = ApiKeys::from_env_value(var("UHI_API_KEYS"))?;
    if api_keys.is_empty() {
        tracing::warn!("UHI_API_KEYS is empty; every authenticated endpoint will refuse requests");
    }

    Ok(AppState {
        gateway: Arc::new(gateway),
        api_keys: Arc::new(api_keys),
    })
}
