//! Constants used throughout the UHI core crate.

/// Beckn domain code for healthcare services.
pub const DEFAULT_DOMAIN: &str = "nic2004:85111";

/// Directory name for durable consent artifacts.
pub const CONSENTS_DIR_NAME: &str = "consents";

/// Directory name for durable correlator tickets.
pub const TICKETS_DIR_NAME: &str = "tickets";

/// Directory name for durable transaction records.
pub const TRANSACTIONS_DIR_NAME: &str = "transactions";

/// Directory name for durable claim cases.
pub const CLAIMS_DIR_NAME: &str = "claims";

/// Default directory for durable state when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "uhi_data";

/// TTL stamped on outbound envelopes, and the callback deadline for single-response steps.
pub const DEFAULT_TTL_SECS: u64 = 30;

/// How long a `search` collects `on_search` callbacks.
pub const DEFAULT_SEARCH_WINDOW_SECS: u64 = 10;

/// Overall lifetime of a transaction before it expires.
pub const DEFAULT_TRANSACTION_TTL_SECS: u64 = 3600;

/// Period of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 5000;

/// How long resolved message ids are remembered so re-deliveries are reported as duplicates.
pub const RESOLVED_RETENTION_SECS: i64 = 600;

/// How long settled transactions and claim cases stay in memory after their last change.
/// Older records are only read back from disk on demand.
pub const DEFAULT_SETTLED_RETENTION_SECS: u64 = 86_400;

/// Extension for durable YAML records.
pub const RECORD_EXTENSION: &str = "yaml";
