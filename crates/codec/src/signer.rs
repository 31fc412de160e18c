//! Signing and verification of protocol envelopes.
//!
//! The signed payload is `keyId=<key id>\n` followed by the canonical JSON of the whole
//! envelope with `context.signature` removed. Binding the key id into the payload stops a
//! signature from being replayed under a different registered key.

use crate::canonical::to_canonical_bytes;
use crate::envelope::{strip_signature, timestamp_millis};
use crate::{
    Envelope, KeyId, SignError, SignatureBlock, SigningKeyPair, TrustedKeyRegistry, VerifyError,
    VerifyResult, AUDIT_TARGET,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::Signature;
use serde_json::Value;
use std::sync::Arc;

/// Default tolerance for sender timestamps ahead of the local clock.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 5;

fn signing_payload(key_id: &str, unsigned: &Value) -> Vec<u8> {
    let mut payload = format!("keyId={key_id}\n").into_bytes();
    payload.extend(to_canonical_bytes(unsigned));
    payload
}

/// An envelope together with the exact JSON it was received or emitted as.
///
/// Verification runs over `raw` so that extension fields the typed model does not know
/// about are still covered by the signature.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedEnvelope {
    envelope: Envelope,
    raw: Value,
}

impl SignedEnvelope {
    /// Builds a signed envelope from a received JSON value.
    pub fn from_value(raw: Value) -> VerifyResult<Self> {
        let envelope = Envelope::from_value(&raw)?;
        Ok(Self { envelope, raw })
    }

    /// Builds a signed envelope from an HTTP body plus the optional signature headers.
    ///
    /// Header values fill in a missing `context.signature`. If both are present they must
    /// agree.
    pub fn from_parts(
        body: &[u8],
        signature_header: Option<&str>,
        key_id_header: Option<&str>,
    ) -> VerifyResult<Self> {
        let mut raw: Value = serde_json::from_slice(body)
            .map_err(|e| VerifyError::MalformedEnvelope(format!("invalid JSON: {e}")))?;

        if let (Some(value), Some(key_id)) = (signature_header, key_id_header) {
            let header_block = SignatureBlock {
                key_id: key_id.trim().to_owned(),
                value: value.trim().to_owned(),
            };
            let ctx = raw
                .get_mut("context")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    VerifyError::MalformedEnvelope("schema mismatch at context: missing".into())
                })?;
            match ctx.get("signature") {
                Some(existing) => {
                    let existing: SignatureBlock = serde_json::from_value(existing.clone())
                        .map_err(|e| {
                            VerifyError::MalformedEnvelope(format!(
                                "schema mismatch at context.signature: {e}"
                            ))
                        })?;
                    if existing != header_block {
                        return Err(VerifyError::MalformedEnvelope(
                            "signature headers disagree with context.signature".into(),
                        ));
                    }
                }
                None => {
                    let block = serde_json::to_value(&header_block)
                        .map_err(|e| VerifyError::MalformedEnvelope(e.to_string()))?;
                    ctx.insert("signature".into(), block);
                }
            }
        } else if signature_header.is_some() || key_id_header.is_some() {
            return Err(VerifyError::MalformedEnvelope(
                "X-Signature and X-Signature-KeyId must be sent together".into(),
            ));
        }

        Self::from_value(raw)
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn signature(&self) -> Option<&SignatureBlock> {
        self.envelope.context.signature.as_ref()
    }

    /// `(X-Signature, X-Signature-KeyId)` header values.
    pub fn headers(&self) -> Option<(String, String)> {
        self.signature()
            .map(|sig| (sig.value.clone(), sig.key_id.clone()))
    }

    pub fn to_json_string(&self) -> String {
        self.raw.to_string()
    }

    /// Canonical bytes of the raw envelope, used for audit digests.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        to_canonical_bytes(&self.raw)
    }
}

/// Signs outbound envelopes with the gateway's key.
#[derive(Clone, Debug)]
pub struct Signer {
    key: Arc<SigningKeyPair>,
}

impl Signer {
    pub fn new(key: Arc<SigningKeyPair>) -> Self {
        Self { key }
    }

    pub fn key_id(&self) -> &KeyId {
        self.key.key_id()
    }

    /// Signs an envelope, replacing any existing signature block.
    ///
    /// Deterministic: the same envelope and key always produce the same signature.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::Malformed`] if the TTL is out of range.
    pub fn sign(&self, envelope: Envelope) -> Result<SignedEnvelope, SignError> {
        sign(envelope, &self.key)
    }
}

/// Signs `envelope` with `key`.
///
/// # Errors
///
/// Returns [`SignError::Malformed`] if the TTL is out of range, or
/// [`SignError::Serialization`] if the envelope cannot be rendered as JSON.
pub fn sign(mut envelope: Envelope, key: &SigningKeyPair) -> Result<SignedEnvelope, SignError> {
    if let Some(problem) = envelope.context.ttl_problem() {
        return Err(SignError::Malformed(problem));
    }
    if !envelope.message.is_object() {
        return Err(SignError::Malformed("message must be a JSON object".into()));
    }

    envelope.context.signature = None;
    let unsigned = envelope.unsigned_value()?;
    let key_id = key.key_id().to_string();
    let signature = key.sign(&signing_payload(&key_id, &unsigned));

    envelope.context.signature = Some(SignatureBlock {
        key_id,
        value: B64.encode(signature.to_bytes()),
    });
    let raw = serde_json::to_value(&envelope)?;
    Ok(SignedEnvelope { envelope, raw })
}

/// Verifies `signed` against `registry` at `received_at` with the default clock skew.
pub fn verify(
    signed: &SignedEnvelope,
    registry: &TrustedKeyRegistry,
    received_at: DateTime<Utc>,
) -> VerifyResult<VerifiedEnvelope> {
    verify_with_skew(
        signed,
        registry,
        received_at,
        Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
    )
}

fn verify_with_skew(
    signed: &SignedEnvelope,
    registry: &TrustedKeyRegistry,
    received_at: DateTime<Utc>,
    max_clock_skew: Duration,
) -> VerifyResult<VerifiedEnvelope> {
    let envelope = &signed.envelope;
    envelope.check_structure(received_at, max_clock_skew)?;

    let block = envelope.context.signature.as_ref().ok_or_else(|| {
        VerifyError::MalformedEnvelope("envelope carries no signature".into())
    })?;
    let key_id = KeyId::parse(&block.key_id)
        .map_err(|e| VerifyError::MalformedEnvelope(e.to_string()))?;

    let trusted = registry
        .lookup(&key_id, envelope.context.timestamp)
        .ok_or_else(|| VerifyError::UnknownKey {
            key_id: block.key_id.clone(),
        })?;

    let mismatch = || VerifyError::SignatureMismatch {
        key_id: block.key_id.clone(),
    };
    let sig_bytes = B64.decode(block.value.trim()).map_err(|_| mismatch())?;
    let sig_bytes: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| mismatch())?;
    let signature = Signature::from_bytes(&sig_bytes);

    let mut unsigned = signed.raw.clone();
    strip_signature(&mut unsigned);
    trusted
        .public_key
        .verify_strict(&signing_payload(&block.key_id, &unsigned), &signature)
        .map_err(|_| mismatch())?;

    let expires_at = envelope.context.expires_at().ok_or_else(|| {
        VerifyError::MalformedEnvelope("context.timestamp + ttl is out of range".into())
    })?;
    if received_at >= expires_at {
        return Err(VerifyError::Expired {
            expired_at: timestamp_millis::format(&expires_at),
        });
    }

    Ok(VerifiedEnvelope {
        envelope: envelope.clone(),
        key_id,
        received_at,
    })
}

/// Verifies inbound envelopes against a shared trusted-key registry.
#[derive(Clone, Debug)]
pub struct Verifier {
    registry: Arc<TrustedKeyRegistry>,
    max_clock_skew: Duration,
}

impl Verifier {
    pub fn new(registry: Arc<TrustedKeyRegistry>) -> Self {
        Self {
            registry,
            max_clock_skew: Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
        }
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn registry(&self) -> &Arc<TrustedKeyRegistry> {
        &self.registry
    }

    /// Verifies `signed` as received at `received_at` and emits an audit event.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::MalformedEnvelope`] for structural violations or a missing signature
    /// - [`VerifyError::UnknownKey`] if the key id is not trusted at the message timestamp
    /// - [`VerifyError::SignatureMismatch`] if the signature does not cover the payload
    /// - [`VerifyError::Expired`] if `timestamp + ttl` is not after `received_at`
    pub fn verify(
        &self,
        signed: &SignedEnvelope,
        received_at: DateTime<Utc>,
    ) -> VerifyResult<VerifiedEnvelope> {
        let ctx = &signed.envelope.context;
        let key_id = ctx
            .signature
            .as_ref()
            .map(|s| s.key_id.as_str())
            .unwrap_or("<none>");
        let result = verify_with_skew(signed, &self.registry, received_at, self.max_clock_skew);
        match &result {
            Ok(_) => tracing::info!(
                target: AUDIT_TARGET,
                key_id,
                action = %ctx.action,
                transaction_id = %ctx.transaction_id,
                message_id = %ctx.message_id,
                "envelope verified"
            ),
            Err(err) => tracing::warn!(
                target: AUDIT_TARGET,
                key_id,
                action = %ctx.action,
                transaction_id = %ctx.transaction_id,
                message_id = %ctx.message_id,
                error = %err,
                "envelope rejected"
            ),
        }
        result
    }
}

/// An envelope whose signature, key and freshness have been checked.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedEnvelope {
    envelope: Envelope,
    key_id: KeyId,
    received_at: DateTime<Utc>,
}

impl VerifiedEnvelope {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn context(&self) -> &crate::Context {
        &self.envelope.context
    }

    pub fn message(&self) -> &Value {
        &self.envelope.message
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}
