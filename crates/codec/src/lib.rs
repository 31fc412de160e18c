//! # UHI Codec
//!
//! The trust root of the gateway. Every protocol message that enters or leaves the process
//! passes through this crate:
//!
//! - [`Envelope`] / [`Context`]: the `{context, message}` wire model
//! - [`canonical`]: stable JSON rendering used for signing and audit hashing
//! - [`Signer`] / [`Verifier`]: ed25519 signing over canonical bytes plus the key-id header
//! - [`TrustedKeyRegistry`]: reloadable set of participant public keys
//!
//! Private key material is never logged. Verification outcomes are emitted on the
//! `uhi::audit` tracing target.

pub mod ack;
pub mod action;
pub mod canonical;
pub mod envelope;
pub mod keys;
pub mod signer;

pub use ack::{AckResponse, AckStatus};
pub use action::Action;
pub use envelope::{Context, Envelope, SignatureBlock};
pub use keys::{KeyId, SigningKeyPair, TrustedKey, TrustedKeyRegistry};
pub use signer::{sign, verify, SignedEnvelope, Signer, VerifiedEnvelope, Verifier};

/// Header carrying the base64 ed25519 signature of an envelope.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Header carrying the key id the signature was produced with.
pub const KEY_ID_HEADER: &str = "X-Signature-KeyId";

/// Longest `context.ttl`, in seconds, an envelope may carry.
pub const MAX_TTL_SECS: i64 = 86_400;

/// Tracing target for audit events.
pub const AUDIT_TARGET: &str = "uhi::audit";

/// Reasons an inbound envelope fails verification.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("unknown signing key: {key_id}")]
    UnknownKey { key_id: String },
    #[error("signature does not match payload for key {key_id}")]
    SignatureMismatch { key_id: String },
    #[error("message expired at {expired_at}")]
    Expired { expired_at: String },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Errors raised while signing an outbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("failed to serialise envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while handling key material or the key registry.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("trusted key registry schema mismatch at {path}: {message}")]
    RegistrySchema { path: String, message: String },
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
}

pub type VerifyResult<T> = Result<T, VerifyError>;
