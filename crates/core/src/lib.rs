//! # UHI Core
//!
//! Gateway-side logic for Unified Health Interface transactions.
//!
//! This crate contains:
//! - the consent ledger that gates every release of health information ([`consent`])
//! - the callback correlator pairing asynchronous callbacks with requests ([`correlator`])
//! - the BAP transaction state machine and outbound delivery ([`transaction`])
//! - the registry of validated clinical bundles ([`bundles`])
//! - the claims adapter for pre-authorisation and claim submission ([`claims`])
//! - [`Gateway`], which assembles all of the above
//!
//! **No API concerns**: authentication and HTTP routing belong in `api-shared` and
//! `api-rest`. Signing and verification live in `uhi-codec`, bundle validation in `fhir`.

pub mod bundles;
pub mod claims;
pub mod clock;
pub mod config;
pub mod consent;
pub mod constants;
pub mod correlator;
pub mod error;
pub mod gateway;
mod store;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use bundles::{BundleRegistry, RegisteredBundle};
pub use claims::{
    AdjudicationOutcome, ClaimCallbackOutcome, ClaimCase, ClaimConsent, ClaimStatus,
    ClaimTransition, ClaimsAdapter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    duration_millis_from_env_value, duration_secs_from_env_value, u32_from_env_value,
    CoreConfig, RetryPolicy,
};
pub use consent::{ConsentLedger, FetchGuard};
pub use correlator::{Correlator, Resolution, StatsSnapshot, Ticket, TicketKind, UnmatchedReason};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{
    Gateway, GatewayBuilder, GatewaySweep, InboundOutcome, ReloadReport, ReloadSources,
};
pub use transaction::{
    CallbackOutcome, Issued, RecordingTransport, SweepReport, Transaction, TransactionMachine, TransactionState,
};
