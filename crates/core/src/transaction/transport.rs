//! Outbound envelope transport.
//!
//! [`HttpTransport`] POSTs signed envelopes to `<participant uri>/<action>` and reads the
//! synchronous ACK/NACK. [`RecordingTransport`] keeps envelopes in memory instead and can
//! be scripted to fail, for tests and offline runs.

use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use uhi_codec::{AckResponse, SignedEnvelope, KEY_ID_HEADER, SIGNATURE_HEADER};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS or timeout failure; nothing was acknowledged.
    #[error("participant unreachable: {0}")]
    Unreachable(String),
    /// The participant answered with a non-success HTTP status.
    #[error("participant answered HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The participant answered with a protocol NACK.
    #[error("participant refused the message: {0}")]
    Nack(String),
}

impl TransportError {
    /// Whether sending the same envelope again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable(_) => true,
            TransportError::Rejected { status, .. } => *status >= 500 || *status == 429,
            TransportError::Nack(_) => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Delivers `envelope` to the participant at `uri`.
    async fn send(&self, uri: &str, envelope: &SignedEnvelope) -> Result<(), TransportError>;
}

/// Endpoint for `envelope` at participant base URI `uri`.
pub fn endpoint(uri: &str, envelope: &SignedEnvelope) -> String {
    format!(
        "{}/{}",
        uri.trim_end_matches('/'),
        envelope.envelope().context.action
    )
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport whose individual requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, uri: &str, envelope: &SignedEnvelope) -> Result<(), TransportError> {
        let url = endpoint(uri, envelope);
        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(envelope.to_json_string());
        if let Some((signature, key_id)) = envelope.headers() {
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(KEY_ID_HEADER, key_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;

        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        match serde_json::from_str::<AckResponse>(&body) {
            Ok(ack) if ack.is_ack() => Ok(()),
            Ok(nack) => Err(TransportError::Nack(
                nack.error
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| "NACK without error detail".into()),
            )),
            Err(e) => Err(TransportError::Nack(format!(
                "unreadable acknowledgement from {url}: {e}"
            ))),
        }
    }
}

/// An envelope handed to [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct SentEnvelope {
    pub uri: String,
    pub envelope: SignedEnvelope,
}

/// In-memory transport. Scripted failures are consumed one per send, in order.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentEnvelope>>,
    failures: Mutex<VecDeque<TransportError>>,
    always_fail: Mutex<Option<TransportError>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next send with `error`.
    pub async fn push_failure(&self, error: TransportError) {
        self.failures.lock().await.push_back(error);
    }

    /// Fails every send with `error` until cleared with `None`.
    pub async fn fail_all(&self, error: Option<TransportError>) {
        *self.always_fail.lock().await = error;
    }

    /// Envelopes successfully delivered so far.
    pub async fn sent(&self) -> Vec<SentEnvelope> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, uri: &str, envelope: &SignedEnvelope) -> Result<(), TransportError> {
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always_fail.lock().await.clone() {
            return Err(error);
        }
        self.sent.lock().await.push(SentEnvelope {
            uri: uri.to_owned(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}
