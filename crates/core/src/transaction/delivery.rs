//! Outbound delivery with bounded exponential backoff.
//!
//! The ticket deadline is authoritative: no attempt starts, and no backoff sleep is taken,
//! that would end after it.

use super::transport::{Transport, TransportError};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};
use uhi_codec::SignedEnvelope;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },
    /// The deadline arrived before delivery succeeded.
    DeadlinePassed { attempts: u32 },
    /// The participant refused the envelope; retrying would not help.
    Rejected {
        attempts: u32,
        error: TransportError,
    },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

fn remaining(deadline: DateTime<Utc>, clock: &dyn Clock) -> Option<Duration> {
    (deadline - clock.now())
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

pub async fn deliver(
    transport: &dyn Transport,
    uri: &str,
    envelope: &SignedEnvelope,
    policy: RetryPolicy,
    deadline: DateTime<Utc>,
    clock: &dyn Clock,
) -> DeliveryOutcome {
    let ctx = &envelope.envelope().context;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        let Some(budget) = remaining(deadline, clock) else {
            return DeliveryOutcome::DeadlinePassed { attempts };
        };
        attempts += 1;

        let error = match tokio::time::timeout(budget, transport.send(uri, envelope)).await {
            Ok(Ok(())) => {
                debug!(
                    transaction_id = %ctx.transaction_id,
                    action = %ctx.action,
                    attempts,
                    "envelope delivered"
                );
                return DeliveryOutcome::Delivered { attempts };
            }
            Ok(Err(error)) => error,
            Err(_) => return DeliveryOutcome::DeadlinePassed { attempts },
        };

        if !error.is_retryable() {
            warn!(
                transaction_id = %ctx.transaction_id,
                action = %ctx.action,
                error = %error,
                "envelope rejected"
            );
            return DeliveryOutcome::Rejected { attempts, error };
        }
        if attempts >= max_attempts {
            warn!(
                transaction_id = %ctx.transaction_id,
                action = %ctx.action,
                attempts,
                error = %error,
                "delivery retries exhausted"
            );
            return DeliveryOutcome::Exhausted {
                attempts,
                last_error: error,
            };
        }

        let backoff = policy.backoff_for(attempts);
        match remaining(deadline, clock) {
            Some(left) if backoff < left => {
                debug!(
                    transaction_id = %ctx.transaction_id,
                    action = %ctx.action,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "delivery failed; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            _ => return DeliveryOutcome::DeadlinePassed { attempts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transaction::transport::RecordingTransport;
    use serde_json::json;
    use uhi_codec::{Action, Context, Envelope, SigningKeyPair, KeyId};
    use uhi_uuid::{MessageId, TransactionId};

    fn start() -> DateTime<Utc> {
        "2026-02-01T10:00:00Z".parse().unwrap()
    }

    fn signed() -> SignedEnvelope {
        let key = SigningKeyPair::from_seed(
            KeyId::new("bap.example.org", "k1").unwrap(),
            &[7u8; 32],
        );
        let envelope = Envelope {
            context: Context {
                domain: "nic2004:85111".into(),
                action: Action::Select,
                transaction_id: TransactionId::new(),
                message_id: MessageId::new(),
                bap_id: "bap.example.org".into(),
                bap_uri: "https://bap.example.org/uhi".into(),
                bpp_id: Some("bpp.example.org".into()),
                bpp_uri: Some("https://bpp.example.org/uhi".into()),
                timestamp: start(),
                ttl: 30,
                signature: None,
            },
            message: json!({"order": {"id": "o-1"}}),
        };
        uhi_codec::sign(envelope, &key).unwrap()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_delivers() {
        let clock = ManualClock::new(start());
        let transport = RecordingTransport::new();
        transport
            .push_failure(TransportError::Unreachable("refused".into()))
            .await;
        transport
            .push_failure(TransportError::Rejected {
                status: 503,
                body: String::new(),
            })
            .await;

        let outcome = deliver(
            &transport,
            "https://bpp.example.org/uhi",
            &signed(),
            policy(4),
            start() + chrono::Duration::seconds(30),
            &clock,
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(transport.sent().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let clock = ManualClock::new(start());
        let transport = RecordingTransport::new();
        let error = TransportError::Unreachable("refused".into());
        transport.fail_all(Some(error.clone())).await;

        let outcome = deliver(
            &transport,
            "https://bpp.example.org/uhi",
            &signed(),
            policy(3),
            start() + chrono::Duration::seconds(30),
            &clock,
        )
        .await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Exhausted {
                attempts: 3,
                last_error: error
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nack_is_not_retried() {
        let clock = ManualClock::new(start());
        let transport = RecordingTransport::new();
        transport
            .push_failure(TransportError::Nack("schema".into()))
            .await;

        let outcome = deliver(
            &transport,
            "https://bpp.example.org/uhi",
            &signed(),
            policy(4),
            start() + chrono::Duration::seconds(30),
            &clock,
        )
        .await;
        assert!(matches!(outcome, DeliveryOutcome::Rejected { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn never_backs_off_past_the_deadline() {
        let clock = ManualClock::new(start());
        let transport = RecordingTransport::new();
        transport
            .fail_all(Some(TransportError::Unreachable("refused".into())))
            .await;

        // 50ms left but the first backoff is 100ms.
        let outcome = deliver(
            &transport,
            "https://bpp.example.org/uhi",
            &signed(),
            policy(4),
            start() + chrono::Duration::milliseconds(50),
            &clock,
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::DeadlinePassed { attempts: 1 });

        clock.advance(chrono::Duration::seconds(1));
        let outcome = deliver(
            &transport,
            "https://bpp.example.org/uhi",
            &signed(),
            policy(4),
            start() + chrono::Duration::milliseconds(50),
            &clock,
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::DeadlinePassed { attempts: 0 });
    }
}
