//! Transaction state machine and outbound delivery.
//!
//! States: `created -> searching -> selected -> initiated -> confirmed`, with `cancelled`,
//! `failed` and `expired` reachable from any non-terminal state.

mod delivery;
mod machine;
mod state;
mod transport;

pub use delivery::{deliver, DeliveryOutcome};
pub use machine::{CallbackOutcome, Issued, SweepReport, TransactionMachine};
pub use state::{
    Candidate, Direction, DroppedCallback, FailureReason, MessageRecord, Participant,
    StateChange, Transaction, TransactionState,
};
pub use transport::{
    endpoint, HttpTransport, RecordingTransport, SentEnvelope, Transport, TransportError,
};
