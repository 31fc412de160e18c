//! Identifier and sharded-path utilities.
//!
//! The gateway deals with two identifier shapes:
//!
//! - **Protocol identifiers** (`transaction_id`, `message_id`) travel on the wire in the
//!   hyphenated RFC 4122 form used by UHI participants. Each has its own newtype here so a
//!   `MessageId` can never be passed where a `TransactionId` is expected.
//! - **Storage identifiers** use the canonical *simple* form (32 lowercase hex characters)
//!   wrapped in [`ShardableUuid`], which derives sharded on-disk locations.
//!
//! ## Sharded layout
//! For a canonical UUID `u`, durable records live under:
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>.yaml`
//!
//! This keeps directory fan-out bounded as consent artifacts and tickets accumulate.

mod ids;
mod shard;

pub use ids::{BundleId, ClaimId, ConsentId, MessageId, TransactionId};
pub use shard::ShardableUuid;
pub use uuid::Uuid;

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
