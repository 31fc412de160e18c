//! Protocol envelope wire model.
//!
//! An envelope is `{"context": {...}, "message": {...}}`. The context carries routing,
//! correlation and freshness metadata; the message is an action-specific JSON object that
//! this crate treats as opaque.
//!
//! Parsing uses `serde_path_to_error` so a structural failure reports the offending field
//! (for example `context.ttl`) in the resulting [`VerifyError::MalformedEnvelope`].

use crate::{Action, VerifyError, MAX_TTL_SECS};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uhi_uuid::{MessageId, TransactionId};

/// Signature material attached to a signed envelope's context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureBlock {
    /// `subscriber_id|unique_key_id|ed25519`
    pub key_id: String,
    /// Base64 (standard alphabet) ed25519 signature.
    pub value: String,
}

/// Envelope context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub domain: String,
    pub action: Action,
    pub transaction_id: TransactionId,
    pub message_id: MessageId,
    pub bap_id: String,
    pub bap_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_uri: Option<String>,
    /// UTC, millisecond precision.
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,
    /// Seconds; must be positive and at most [`MAX_TTL_SECS`].
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
}

impl Context {
    /// Instant after which the message must no longer be accepted, or `None` when
    /// `timestamp + ttl` falls outside the representable range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Duration::try_seconds(self.ttl).and_then(|ttl| self.timestamp.checked_add_signed(ttl))
    }

    /// Rejects TTLs outside `1..=MAX_TTL_SECS`.
    pub(crate) fn ttl_problem(&self) -> Option<String> {
        if self.ttl <= 0 {
            Some(format!("context.ttl must be positive, got {}", self.ttl))
        } else if self.ttl > MAX_TTL_SECS {
            Some(format!(
                "context.ttl must be at most {MAX_TTL_SECS} seconds, got {}",
                self.ttl
            ))
        } else {
            None
        }
    }
}

/// A protocol envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub context: Context,
    pub message: Value,
}

impl Envelope {
    /// Parses an envelope from a JSON value, reporting the failing path on mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedEnvelope`] if the value does not match the wire
    /// schema.
    pub fn from_value(value: &Value) -> Result<Self, VerifyError> {
        serde_path_to_error::deserialize::<_, Envelope>(value).map_err(|err| {
            let path = err.path().to_string();
            let source = err.into_inner();
            let path = if path.is_empty() || path == "." {
                "<root>".to_owned()
            } else {
                path
            };
            VerifyError::MalformedEnvelope(format!("schema mismatch at {path}: {source}"))
        })
    }

    /// Parses an envelope from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedEnvelope`] for invalid JSON or schema mismatches.
    pub fn parse(json_text: &str) -> Result<Self, VerifyError> {
        let value: Value = serde_json::from_str(json_text)
            .map_err(|e| VerifyError::MalformedEnvelope(format!("invalid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Structural checks that do not depend on key material.
    ///
    /// Rejects out-of-range TTLs, empty identifiers, unparseable participant URIs, callbacks
    /// without a responder, non-object messages and timestamps further in the future than
    /// `max_clock_skew`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedEnvelope`] describing the first violated rule.
    pub fn check_structure(
        &self,
        now: DateTime<Utc>,
        max_clock_skew: Duration,
    ) -> Result<(), VerifyError> {
        let ctx = &self.context;
        let malformed = |msg: String| Err(VerifyError::MalformedEnvelope(msg));

        if let Some(problem) = ctx.ttl_problem() {
            return malformed(problem);
        }
        if ctx.domain.trim().is_empty() {
            return malformed("context.domain cannot be empty".into());
        }
        if ctx.bap_id.trim().is_empty() {
            return malformed("context.bap_id cannot be empty".into());
        }
        check_uri("context.bap_uri", &ctx.bap_uri)?;

        match (&ctx.bpp_id, &ctx.bpp_uri) {
            (Some(id), Some(uri)) => {
                if id.trim().is_empty() {
                    return malformed("context.bpp_id cannot be empty".into());
                }
                check_uri("context.bpp_uri", uri)?;
            }
            (None, None) => {
                if ctx.action.is_callback() {
                    return malformed(format!(
                        "{} callbacks must identify the responding participant",
                        ctx.action
                    ));
                }
            }
            _ => {
                return malformed("context.bpp_id and context.bpp_uri must be set together".into())
            }
        }

        if !self.message.is_object() {
            return malformed("message must be a JSON object".into());
        }
        if ctx.timestamp > now + max_clock_skew {
            return malformed(format!(
                "context.timestamp {} is in the future",
                timestamp_millis::format(&ctx.timestamp)
            ));
        }
        Ok(())
    }

    /// The envelope as a JSON value with `context.signature` removed.
    pub(crate) fn unsigned_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        strip_signature(&mut value);
        Ok(value)
    }
}

/// Removes `context.signature` from a raw envelope value.
pub(crate) fn strip_signature(value: &mut Value) {
    if let Some(ctx) = value.get_mut("context").and_then(Value::as_object_mut) {
        ctx.remove("signature");
    }
}

fn check_uri(field: &str, uri: &str) -> Result<(), VerifyError> {
    match url::Url::parse(uri) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(VerifyError::MalformedEnvelope(format!(
            "{field} must use http or https, got '{}'",
            parsed.scheme()
        ))),
        Err(e) => Err(VerifyError::MalformedEnvelope(format!(
            "{field} is not a valid URI: {e}"
        ))),
    }
}

/// Serde helpers for UTC timestamps with millisecond precision.
pub mod timestamp_millis {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(3))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "context": {
                "domain": "nic2004:85111",
                "action": "select",
                "transaction_id": "6a1f7a3e-8f0c-4a4a-9c55-5f1e5b0f2a11",
                "message_id": "0b6f0c5e-2d4a-4f0e-8a56-1d3b3e0c9f22",
                "bap_id": "hiu.example.org",
                "bap_uri": "https://hiu.example.org/uhi",
                "bpp_id": "hip.example.org",
                "bpp_uri": "https://hip.example.org/uhi",
                "timestamp": "2026-01-11T14:35:22.045Z",
                "ttl": 30
            },
            "message": {"order": {"id": "o-1"}}
        })
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_sample_envelope() {
        let env = Envelope::from_value(&sample()).expect("parse");
        assert_eq!(env.context.action, Action::Select);
        assert_eq!(env.context.ttl, 30);
        assert_eq!(
            env.context.expires_at(),
            Some(at("2026-01-11T14:35:52.045Z"))
        );
    }

    #[test]
    fn schema_mismatch_reports_path() {
        let mut value = sample();
        value["context"]["ttl"] = json!("thirty");
        let err = Envelope::from_value(&value).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(msg) if msg.contains("context.ttl")));
    }

    #[test]
    fn timestamps_are_truncated_to_milliseconds() {
        let mut value = sample();
        value["context"]["timestamp"] = json!("2026-01-11T14:35:22.045999Z");
        let env = Envelope::from_value(&value).unwrap();
        assert_eq!(
            timestamp_millis::format(&env.context.timestamp),
            "2026-01-11T14:35:22.045Z"
        );
    }

    #[test]
    fn unrepresentable_expiry_is_none() {
        let mut env = Envelope::from_value(&sample()).unwrap();
        env.context.ttl = i64::MAX;
        assert_eq!(env.context.expires_at(), None);
        let err = env
            .check_structure(at("2026-01-11T14:35:23Z"), Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(msg) if msg.contains("at most")));
    }

    #[test]
    fn non_positive_ttl_is_malformed() {
        let mut value = sample();
        value["context"]["ttl"] = json!(0);
        let env = Envelope::from_value(&value).unwrap();
        let err = env
            .check_structure(at("2026-01-11T14:35:23Z"), Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(msg) if msg.contains("ttl")));
    }

    #[test]
    fn callbacks_require_a_responder() {
        let mut value = sample();
        value["context"]["action"] = json!("on_select");
        let ctx = value["context"].as_object_mut().unwrap();
        ctx.remove("bpp_id");
        ctx.remove("bpp_uri");
        let env = Envelope::from_value(&value).unwrap();
        let err = env
            .check_structure(at("2026-01-11T14:35:23Z"), Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(msg) if msg.contains("on_select")));
    }

    #[test]
    fn future_timestamps_beyond_skew_are_malformed() {
        let env = Envelope::from_value(&sample()).unwrap();
        assert!(env
            .check_structure(at("2026-01-11T14:35:20Z"), Duration::seconds(5))
            .is_ok());
        assert!(env
            .check_structure(at("2026-01-11T14:35:00Z"), Duration::seconds(5))
            .is_err());
    }

    #[test]
    fn rejects_non_http_uris() {
        let mut value = sample();
        value["context"]["bap_uri"] = json!("ftp://hiu.example.org");
        let env = Envelope::from_value(&value).unwrap();
        assert!(env
            .check_structure(at("2026-01-11T14:35:23Z"), Duration::seconds(5))
            .is_err());
    }
}
