use fhir::ValidationError;
use uhi_codec::{Action, SignError, VerifyError};
use uhi_uuid::TransactionId;

use crate::consent::DenyReason;

/// Errors surfaced by the gateway core.
///
/// The first group mirrors the protocol error taxonomy; the rest are operational.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("unknown signing key: {0}")]
    UnknownKey(String),
    #[error("expired: {0}")]
    Expired(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("a {action} request is already outstanding for transaction {transaction_id}")]
    DuplicateOutstanding {
        transaction_id: TransactionId,
        action: Action,
    },
    #[error("callback {0} matches no outstanding request")]
    Unmatched(String),
    #[error("transaction {0} timed out")]
    Timeout(TransactionId),
    #[error("cannot {operation} {entity} in state {state}")]
    InvalidState {
        entity: &'static str,
        state: String,
        operation: String,
    },
    #[error("consent denied: {0}")]
    ConsentDenied(DenyReason),
    #[error("bundle validation failed with {} error(s)", .0.len())]
    BundleValidationFailed(Vec<ValidationError>),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialisation error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub(crate) fn invalid_state(
        entity: &'static str,
        state: impl std::fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        GatewayError::InvalidState {
            entity,
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SignatureInvalid(_) => "signature_invalid",
            GatewayError::UnknownKey(_) => "unknown_key",
            GatewayError::Expired(_) => "expired",
            GatewayError::MalformedEnvelope(_) => "malformed_envelope",
            GatewayError::DuplicateOutstanding { .. } => "duplicate_outstanding",
            GatewayError::Unmatched(_) => "unmatched",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::InvalidState { .. } => "invalid_state",
            GatewayError::ConsentDenied(_) => "consent_denied",
            GatewayError::BundleValidationFailed(_) => "bundle_validation_failed",
            GatewayError::PreconditionFailed(_) => "precondition_failed",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::Storage(_) => "storage",
            GatewayError::Serialization(_) => "serialization",
            GatewayError::Transport(_) => "transport",
        }
    }
}

impl From<VerifyError> for GatewayError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::UnknownKey { key_id } => GatewayError::UnknownKey(key_id),
            err @ VerifyError::SignatureMismatch { .. } => {
                GatewayError::SignatureInvalid(err.to_string())
            }
            VerifyError::Expired { expired_at } => {
                GatewayError::Expired(format!("message expired at {expired_at}"))
            }
            VerifyError::MalformedEnvelope(msg) => GatewayError::MalformedEnvelope(msg),
        }
    }
}

impl From<SignError> for GatewayError {
    fn from(err: SignError) -> Self {
        match err {
            SignError::Malformed(msg) => GatewayError::MalformedEnvelope(msg),
            SignError::Serialization(e) => GatewayError::Serialization(e.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
