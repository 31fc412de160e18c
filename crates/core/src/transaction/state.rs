//! Transaction record and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uhi_codec::Action;
use uhi_uuid::{MessageId, TransactionId};

use crate::correlator::UnmatchedReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Created,
    Searching,
    Selected,
    Initiated,
    Confirmed,
    Cancelled,
    Failed,
    Expired,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Confirmed
                | TransactionState::Cancelled
                | TransactionState::Failed
                | TransactionState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::Searching => "searching",
            TransactionState::Selected => "selected",
            TransactionState::Initiated => "initiated",
            TransactionState::Confirmed => "confirmed",
            TransactionState::Cancelled => "cancelled",
            TransactionState::Failed => "failed",
            TransactionState::Expired => "expired",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transaction ended in `failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A callback matching an outstanding request failed verification.
    SignatureInvalid,
    /// A callback matching an outstanding request arrived after its own TTL.
    MessageExpired,
    /// No callback before the deadline, or delivery retries were exhausted.
    Timeout,
    /// The counterparty answered with a protocol error or refused the request.
    CounterpartyError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::SignatureInvalid => "signature_invalid",
            FailureReason::MessageExpired => "message_expired",
            FailureReason::Timeout => "timeout",
            FailureReason::CounterpartyError => "counterparty_error",
        })
    }
}

/// A network participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub uri: String,
}

/// One provider's answer to a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: Participant,
    pub message_id: MessageId,
    pub received_at: DateTime<Utc>,
    pub catalog: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Audit entry for an envelope sent or accepted on this transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub action: Action,
    pub direction: Direction,
    pub at: DateTime<Utc>,
    /// SHA-256 (hex) of the canonical signed envelope.
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: TransactionState,
    pub to: TransactionState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// A callback that reached this transaction but changed nothing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedCallback {
    pub message_id: MessageId,
    pub action: Action,
    pub reason: UnmatchedReason,
    pub at: DateTime<Utc>,
}

/// One care/service episode from first request to terminal state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    pub bap: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp: Option<Participant>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub care_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment_status: Option<String>,
    #[serde(default)]
    pub cancel_acknowledged: bool,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub history: Vec<StateChange>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub dropped: Vec<DroppedCallback>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        bap: Participant,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Created,
            failure: None,
            failure_detail: None,
            bap,
            bpp: None,
            created_at,
            deadline,
            care_context_id: None,
            order_id: None,
            quote: None,
            fulfillment_status: None,
            cancel_acknowledged: false,
            candidates: Vec::new(),
            history: Vec::new(),
            messages: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Moves to `to`, recording the change. Same-state moves are not recorded.
    pub(crate) fn transition(
        &mut self,
        to: TransactionState,
        at: DateTime<Utc>,
        cause: Option<String>,
    ) {
        if self.state == to {
            return;
        }
        self.history.push(StateChange {
            from: self.state,
            to,
            at,
            cause,
        });
        self.state = to;
    }

    pub(crate) fn fail(&mut self, reason: FailureReason, detail: String, at: DateTime<Utc>) {
        self.failure = Some(reason);
        self.failure_detail = Some(detail.clone());
        self.transition(TransactionState::Failed, at, Some(format!("{reason}: {detail}")));
    }

    /// Time of the latest state change, or creation if there has been none.
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.history.last().map_or(self.created_at, |change| change.at)
    }

    pub fn candidate(&self, bpp_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.provider.id == bpp_id)
    }
}
