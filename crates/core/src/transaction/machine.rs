//! BAP-side transaction state machine.
//!
//! Each transaction lives in its own slot guarded by a `tokio::sync::Mutex`, so mutation
//! is serialised per transaction while different transactions proceed independently.
//! Issuing a request signs it, registers a correlator ticket and hands delivery to a
//! spawned task; nothing blocks waiting for the callback. The callback, the periodic
//! [`TransactionMachine::sweep`] or a delivery failure drives the next transition.
//!
//! Cancel raises a per-slot flag before queueing for the lock, so a callback that is
//! processed while a cancel is pending is dropped rather than applied.

use super::delivery::{deliver, DeliveryOutcome};
use super::state::{
    Candidate, Direction, DroppedCallback, FailureReason, MessageRecord, Participant,
    Transaction, TransactionState,
};
use super::transport::Transport;
use crate::clock::{after, Clock};
use crate::config::CoreConfig;
use crate::correlator::{Correlator, Resolution, Ticket, TicketKind, UnmatchedReason};
use crate::store::YamlStore;
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uhi_codec::{
    Action, Context, Envelope, SignedEnvelope, Signer, VerifiedEnvelope, Verifier, VerifyError,
    AUDIT_TARGET, MAX_TTL_SECS,
};
use uhi_uuid::{MessageId, TransactionId};

/// Message locations checked, in order, for the care context created by a confirmation.
const CARE_CONTEXT_POINTERS: [&str; 3] = [
    "/order/care_context_id",
    "/order/fulfillment/care_context_id",
    "/care_context_id",
];

const FULFILLMENT_STATUS_POINTERS: [&str; 2] =
    ["/order/state", "/order/fulfillment/state/descriptor/code"];

#[derive(Debug)]
struct TransactionSlot {
    record: Mutex<Transaction>,
    cancel_requested: AtomicBool,
}

/// A signed request on its way out.
#[derive(Debug)]
pub struct Issued {
    pub transaction_id: TransactionId,
    pub message_id: MessageId,
    pub envelope: SignedEnvelope,
    /// Completes when delivery succeeds or is abandoned. Dropping it detaches delivery.
    pub delivery: JoinHandle<DeliveryOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied {
        transaction_id: TransactionId,
        state: TransactionState,
    },
    Dropped {
        transaction_id: TransactionId,
        reason: UnmatchedReason,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Transactions failed because a single-response ticket passed its deadline.
    pub timed_out: Vec<TransactionId>,
    /// Transactions whose overall deadline passed.
    pub expired: Vec<TransactionId>,
    /// Searches whose collection window elapsed.
    pub windows_closed: Vec<TransactionId>,
    /// Expired tickets owned by other components (claims exchange).
    pub other_tickets: Vec<Ticket>,
    /// Settled transactions dropped from memory after the retention window.
    pub evicted: Vec<TransactionId>,
}

#[derive(Debug)]
pub struct TransactionMachine {
    config: Arc<CoreConfig>,
    clock: Arc<dyn Clock>,
    signer: Signer,
    verifier: Verifier,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    transactions: DashMap<TransactionId, Arc<TransactionSlot>>,
    store: Option<YamlStore<Transaction>>,
}

impl TransactionMachine {
    pub fn new(
        config: Arc<CoreConfig>,
        clock: Arc<dyn Clock>,
        signer: Signer,
        verifier: Verifier,
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
    ) -> Self {
        Self {
            config,
            clock,
            signer,
            verifier,
            transport,
            correlator,
            transactions: DashMap::new(),
            store: None,
        }
    }

    /// Machine persisted under `dir`. Open transactions, and settled ones still inside the
    /// retention window, are reloaded; older records are read from disk on demand.
    pub fn open(
        config: Arc<CoreConfig>,
        clock: Arc<dyn Clock>,
        signer: Signer,
        verifier: Verifier,
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        dir: PathBuf,
    ) -> GatewayResult<Self> {
        let store: YamlStore<Transaction> = YamlStore::open(dir)?;
        let mut machine = Self::new(config, clock, signer, verifier, transport, correlator);
        let now = machine.clock.now();
        for record in store.load_all() {
            if machine.is_evictable(&record, now) {
                continue;
            }
            let id = record.id;
            let slot = Arc::new(TransactionSlot {
                record: Mutex::new(record),
                cancel_requested: AtomicBool::new(false),
            });
            machine.transactions.insert(id, slot);
        }
        info!(
            count = machine.transactions.len(),
            dir = %store.root().display(),
            "transactions loaded"
        );
        machine.store = Some(store);
        Ok(machine)
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts a transaction by broadcasting a search through the network gateway.
    ///
    /// # Errors
    ///
    /// [`GatewayError::PreconditionFailed`] if no gateway URI is configured.
    pub async fn search(self: &Arc<Self>, intent: Value) -> GatewayResult<Issued> {
        let gateway = self
            .config
            .gateway_uri()
            .ok_or_else(|| {
                GatewayError::PreconditionFailed("no gateway URI configured for search".into())
            })?
            .to_owned();

        let (transaction_id, slot) = self.create_transaction();
        let mut record = slot.record.lock().await;
        let deadline = after(self.clock.now(), self.config.search_window()).min(record.deadline);

        match self.issue_locked(&mut record, Action::Search, intent, None, gateway, deadline) {
            Ok(issued) => {
                let now = self.clock.now();
                record.transition(TransactionState::Searching, now, Some("search issued".into()));
                audit_transition(&record);
                self.persist(&record);
                Ok(issued)
            }
            Err(e) => {
                drop(record);
                self.transactions.remove(&transaction_id);
                Err(e)
            }
        }
    }

    /// Starts a transaction by selecting from a provider already known to the caller.
    pub async fn begin_select(
        self: &Arc<Self>,
        provider: Participant,
        order: Value,
    ) -> GatewayResult<Issued> {
        let (transaction_id, slot) = self.create_transaction();
        let mut record = slot.record.lock().await;
        let result = self.issue_to_provider(&mut record, Action::Select, order, &provider);
        match result {
            Ok(issued) => {
                record.bpp = Some(provider);
                self.persist(&record);
                Ok(issued)
            }
            Err(e) => {
                drop(record);
                self.transactions.remove(&transaction_id);
                Err(e)
            }
        }
    }

    /// Selects an offer from `bpp_id`, which must have answered the search (or be the
    /// provider already selected).
    pub async fn select(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        bpp_id: &str,
        order: Value,
    ) -> GatewayResult<Issued> {
        let slot = self.slot(transaction_id)?;
        let mut record = slot.record.lock().await;
        ensure_state(
            &record,
            Action::Select,
            &[TransactionState::Searching, TransactionState::Selected],
        )?;

        let provider = record
            .candidate(bpp_id)
            .map(|c| c.provider.clone())
            .or_else(|| record.bpp.clone().filter(|p| p.id == bpp_id))
            .ok_or_else(|| {
                GatewayError::PreconditionFailed(format!(
                    "provider {bpp_id} has not answered transaction {transaction_id}"
                ))
            })?;

        let issued = self.issue_to_provider(&mut record, Action::Select, order, &provider)?;
        if self.correlator.close(transaction_id, Action::Search).is_some() {
            debug!(transaction_id = %transaction_id, "search window closed by select");
        }
        record.bpp = Some(provider);
        self.persist(&record);
        Ok(issued)
    }

    pub async fn init(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        order: Value,
    ) -> GatewayResult<Issued> {
        self.issue_to_selected(
            transaction_id,
            Action::Init,
            order,
            &[TransactionState::Selected],
        )
        .await
    }

    pub async fn confirm(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        order: Value,
    ) -> GatewayResult<Issued> {
        self.issue_to_selected(
            transaction_id,
            Action::Confirm,
            order,
            &[TransactionState::Initiated],
        )
        .await
    }

    /// Asks the provider for fulfilment status. Never advances the state.
    pub async fn status(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        order: Value,
    ) -> GatewayResult<Issued> {
        self.issue_to_selected(
            transaction_id,
            Action::Status,
            order,
            &[
                TransactionState::Selected,
                TransactionState::Initiated,
                TransactionState::Confirmed,
            ],
        )
        .await
    }

    /// Cancels a non-terminal transaction.
    ///
    /// The transaction is `cancelled` as soon as this returns. If a provider is involved a
    /// signed `cancel` is sent (with retries); its delivery failing never changes the state.
    /// Returns `None` when there was nobody to notify.
    pub async fn cancel(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        reason: Value,
    ) -> GatewayResult<Option<Issued>> {
        let slot = self.slot(transaction_id)?;
        if !reason.is_object() {
            return Err(GatewayError::InvalidInput(
                "cancel message must be a JSON object".into(),
            ));
        }
        slot.cancel_requested.store(true, Ordering::SeqCst);
        let mut record = slot.record.lock().await;
        if record.state.is_terminal() {
            return Err(GatewayError::invalid_state(
                "transaction",
                record.state,
                "cancel",
            ));
        }

        let released = self.correlator.release_transaction(transaction_id);
        debug!(
            transaction_id = %transaction_id,
            released = released.len(),
            "released tickets for cancel"
        );

        let issued = match record.bpp.clone() {
            Some(provider) => {
                match self.issue_to_provider(&mut record, Action::Cancel, reason, &provider) {
                    Ok(issued) => Some(issued),
                    Err(e) => {
                        warn!(
                            transaction_id = %transaction_id,
                            error = %e,
                            "could not send cancel; cancelling locally"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let now = self.clock.now();
        record.transition(
            TransactionState::Cancelled,
            now,
            Some("cancel requested".into()),
        );
        audit_transition(&record);
        self.persist(&record);
        Ok(issued)
    }

    /// Ends on_search collection early.
    pub async fn close_search(&self, transaction_id: TransactionId) -> GatewayResult<Transaction> {
        let slot = self.slot(transaction_id)?;
        let record = slot.record.lock().await;
        ensure_state(&record, Action::Search, &[TransactionState::Searching])?;
        self.correlator.close(transaction_id, Action::Search);
        Ok(record.clone())
    }

    /// Current record for `transaction_id`. Settled transactions already evicted from
    /// memory are read back from disk.
    pub async fn snapshot(&self, transaction_id: TransactionId) -> Option<Transaction> {
        match self.slot(transaction_id) {
            Ok(slot) => Some(slot.record.lock().await.clone()),
            Err(_) => self.load_settled(transaction_id),
        }
    }

    pub async fn state(&self, transaction_id: TransactionId) -> Option<TransactionState> {
        self.snapshot(transaction_id).await.map(|record| record.state)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Verifies and applies an inbound UHI callback.
    ///
    /// Unmatched callbacks are reported as [`CallbackOutcome::Dropped`], never as errors.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidInput`] for non-callback or claims actions
    /// - the verification error if the envelope fails verification; when it answers an
    ///   outstanding request the transaction is failed first
    pub async fn handle_callback(&self, signed: &SignedEnvelope) -> GatewayResult<CallbackOutcome> {
        let ctx = &signed.envelope().context;
        if !ctx.action.is_callback() || ctx.action.is_claims() {
            return Err(GatewayError::InvalidInput(format!(
                "{} is not a transaction callback",
                ctx.action
            )));
        }

        let received_at = self.clock.now();
        let verified = match self.verifier.verify(signed, received_at) {
            Ok(verified) => verified,
            Err(err) => {
                self.fail_on_rejected_callback(ctx, &err).await;
                return Err(err.into());
            }
        };

        let transaction_id = ctx.transaction_id;
        let Ok(slot) = self.slot(transaction_id) else {
            self.correlator
                .note_unmatched(ctx.message_id, UnmatchedReason::UnknownMessage);
            return Ok(CallbackOutcome::Dropped {
                transaction_id,
                reason: UnmatchedReason::UnknownMessage,
            });
        };

        let mut record = slot.record.lock().await;
        let cancelling = slot.cancel_requested.load(Ordering::SeqCst);
        let outcome = if !accepts_callback(record.state, ctx.action, cancelling) {
            self.correlator
                .note_unmatched(ctx.message_id, UnmatchedReason::Terminal);
            Ok(drop_callback(&mut record, ctx, UnmatchedReason::Terminal, received_at))
        } else {
            match self.correlator.resolve(ctx.message_id, ctx) {
                Resolution::Unmatched(reason) => {
                    Ok(drop_callback(&mut record, ctx, reason, received_at))
                }
                Resolution::Matched(_) => {
                    self.apply_callback(&mut record, signed, &verified, received_at)
                }
            }
        };
        self.persist(&record);
        outcome
    }

    /// Applies deadlines at `now`: timed-out tickets fail their transaction (exactly once,
    /// since the correlator hands each expired ticket back once), elapsed search windows
    /// close, and transactions past their overall deadline expire.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for ticket in self.correlator.sweep(now) {
            if ticket.action.is_claims() {
                report.other_tickets.push(ticket);
                continue;
            }
            let Ok(slot) = self.slot(ticket.transaction_id) else {
                debug!(
                    transaction_id = %ticket.transaction_id,
                    "expired ticket for unknown transaction"
                );
                continue;
            };
            let mut record = slot.record.lock().await;
            if record.state.is_terminal() {
                continue;
            }
            match ticket.kind {
                TicketKind::Collecting => {
                    info!(
                        transaction_id = %ticket.transaction_id,
                        candidates = record.candidates.len(),
                        "search window closed"
                    );
                    report.windows_closed.push(ticket.transaction_id);
                }
                TicketKind::Single => {
                    let expected = ticket.action.callback().unwrap_or(ticket.action);
                    record.fail(
                        FailureReason::Timeout,
                        format!("no {expected} before {}", ticket.deadline),
                        now,
                    );
                    self.correlator.release_transaction(ticket.transaction_id);
                    audit_transition(&record);
                    self.persist(&record);
                    report.timed_out.push(ticket.transaction_id);
                }
            }
        }

        let slots: Vec<Arc<TransactionSlot>> = self
            .transactions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in slots {
            let mut record = slot.record.lock().await;
            if record.state.is_terminal() {
                if self.is_evictable(&record, now) {
                    report.evicted.push(record.id);
                }
                continue;
            }
            if now < record.deadline {
                continue;
            }
            let cause = format!("transaction deadline {} passed", record.deadline);
            record.transition(TransactionState::Expired, now, Some(cause));
            self.correlator.release_transaction(record.id);
            audit_transition(&record);
            self.persist(&record);
            report.expired.push(record.id);
        }
        for id in &report.evicted {
            self.transactions.remove(id);
            debug!(transaction_id = %id, "settled transaction evicted from memory");
        }

        report
    }

    /// Settled and unchanged for longer than the retention window.
    fn is_evictable(&self, record: &Transaction, now: DateTime<Utc>) -> bool {
        record.state.is_terminal()
            && after(record.last_changed_at(), self.config.settled_retention()) <= now
    }

    /// Writes `record` through to disk. A failed write is logged and the in-memory record
    /// stays authoritative.
    fn persist(&self, record: &Transaction) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&record.id.shardable(), record) {
            warn!(transaction_id = %record.id, error = %e, "failed to persist transaction");
        }
    }

    fn load_settled(&self, transaction_id: TransactionId) -> Option<Transaction> {
        let store = self.store.as_ref()?;
        match store.load(&transaction_id.shardable()) {
            Ok(record) => record,
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "failed to read transaction");
                None
            }
        }
    }

    fn create_transaction(&self) -> (TransactionId, Arc<TransactionSlot>) {
        let now = self.clock.now();
        let id = TransactionId::new();
        let bap = Participant {
            id: self.config.subscriber_id().to_owned(),
            uri: self.config.subscriber_uri().to_owned(),
        };
        let record = Transaction::new(id, bap, now, after(now, self.config.transaction_ttl()));
        let slot = Arc::new(TransactionSlot {
            record: Mutex::new(record),
            cancel_requested: AtomicBool::new(false),
        });
        self.transactions.insert(id, Arc::clone(&slot));
        info!(transaction_id = %id, "transaction created");
        (id, slot)
    }

    fn slot(&self, transaction_id: TransactionId) -> GatewayResult<Arc<TransactionSlot>> {
        self.transactions
            .get(&transaction_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::NotFound(format!("transaction {transaction_id}")))
    }

    async fn issue_to_selected(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        action: Action,
        order: Value,
        allowed: &[TransactionState],
    ) -> GatewayResult<Issued> {
        let slot = self.slot(transaction_id)?;
        let mut record = slot.record.lock().await;
        ensure_state(&record, action, allowed)?;
        let provider = record.bpp.clone().ok_or_else(|| {
            GatewayError::PreconditionFailed(format!(
                "transaction {transaction_id} has no selected provider"
            ))
        })?;
        let issued = self.issue_to_provider(&mut record, action, order, &provider)?;
        self.persist(&record);
        Ok(issued)
    }

    /// Issues a single-response request to `provider`, refusing while any other
    /// single-response request on the transaction is still outstanding.
    fn issue_to_provider(
        self: &Arc<Self>,
        record: &mut Transaction,
        action: Action,
        message: Value,
        provider: &Participant,
    ) -> GatewayResult<Issued> {
        if action != Action::Cancel {
            if let Some(pending) = self
                .correlator
                .outstanding(record.id)
                .into_iter()
                .find(|t| t.kind == TicketKind::Single)
            {
                return Err(GatewayError::DuplicateOutstanding {
                    transaction_id: record.id,
                    action: pending.action,
                });
            }
        }
        let deadline = after(self.clock.now(), self.config.default_ttl()).min(record.deadline);
        self.issue_locked(
            record,
            action,
            message,
            Some(provider),
            provider.uri.clone(),
            deadline,
        )
    }

    /// Signs, registers and dispatches one request. Caller holds the transaction lock.
    fn issue_locked(
        self: &Arc<Self>,
        record: &mut Transaction,
        action: Action,
        message: Value,
        provider: Option<&Participant>,
        destination: String,
        deadline: DateTime<Utc>,
    ) -> GatewayResult<Issued> {
        if !message.is_object() {
            return Err(GatewayError::InvalidInput(format!(
                "{action} message must be a JSON object"
            )));
        }

        let now = self.clock.now();
        let message_id = MessageId::new();
        let envelope = Envelope {
            context: Context {
                domain: self.config.domain().to_owned(),
                action,
                transaction_id: record.id,
                message_id,
                bap_id: record.bap.id.clone(),
                bap_uri: record.bap.uri.clone(),
                bpp_id: provider.map(|p| p.id.clone()),
                bpp_uri: provider.map(|p| p.uri.clone()),
                timestamp: now,
                ttl: i64::try_from(self.config.default_ttl().as_secs())
                    .unwrap_or(MAX_TTL_SECS)
                    .clamp(1, MAX_TTL_SECS),
                signature: None,
            },
            message,
        };
        let signed = self.signer.sign(envelope)?;

        self.correlator.register(
            record.id,
            action,
            message_id,
            deadline,
            provider.map(|p| p.id.clone()),
        )?;
        record.messages.push(MessageRecord {
            message_id,
            action,
            direction: Direction::Outbound,
            at: now,
            sha256: digest(&signed),
        });
        info!(
            target: AUDIT_TARGET,
            transaction_id = %record.id,
            message_id = %message_id,
            action = %action,
            key_id = %self.signer.key_id(),
            destination = %destination,
            "request issued"
        );

        let delivery =
            self.spawn_delivery(record.id, action, message_id, destination, signed.clone(), deadline);
        Ok(Issued {
            transaction_id: record.id,
            message_id,
            envelope: signed,
            delivery,
        })
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        action: Action,
        message_id: MessageId,
        destination: String,
        signed: SignedEnvelope,
        deadline: DateTime<Utc>,
    ) -> JoinHandle<DeliveryOutcome> {
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = deliver(
                machine.transport.as_ref(),
                &destination,
                &signed,
                machine.config.retry(),
                deadline,
                machine.clock.as_ref(),
            )
            .await;
            machine
                .on_delivery_outcome(transaction_id, action, message_id, &outcome)
                .await;
            outcome
        })
    }

    /// Fails the transaction when a request could not be delivered before its deadline ran
    /// out. A deadline passing mid-delivery is left to the sweep.
    async fn on_delivery_outcome(
        &self,
        transaction_id: TransactionId,
        action: Action,
        message_id: MessageId,
        outcome: &DeliveryOutcome,
    ) {
        let (reason, detail) = match outcome {
            DeliveryOutcome::Delivered { .. } | DeliveryOutcome::DeadlinePassed { .. } => return,
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => (
                FailureReason::Timeout,
                format!("{action} undeliverable after {attempts} attempt(s): {last_error}"),
            ),
            DeliveryOutcome::Rejected { error, .. } => (
                FailureReason::CounterpartyError,
                format!("{action} refused: {error}"),
            ),
        };
        if action == Action::Cancel {
            warn!(transaction_id = %transaction_id, detail, "cancel could not be delivered");
            return;
        }

        let Ok(slot) = self.slot(transaction_id) else {
            return;
        };
        let mut record = slot.record.lock().await;
        if record.state.is_terminal() {
            return;
        }
        if self.correlator.close_message(message_id).is_none() {
            // Already answered, closed or swept.
            return;
        }
        record.fail(reason, detail, self.clock.now());
        self.correlator.release_transaction(transaction_id);
        audit_transition(&record);
        self.persist(&record);
    }

    /// A callback that answers an outstanding request but fails verification fails the
    /// transaction. Anything else that fails verification is only rejected.
    async fn fail_on_rejected_callback(&self, ctx: &Context, err: &VerifyError) {
        let Some(ticket) = self.correlator.peek(ctx.message_id) else {
            return;
        };
        if ticket.transaction_id != ctx.transaction_id || ctx.action.request() != Some(ticket.action)
        {
            return;
        }
        let Ok(slot) = self.slot(ctx.transaction_id) else {
            return;
        };
        let mut record = slot.record.lock().await;
        if record.state.is_terminal() || self.correlator.close_message(ctx.message_id).is_none() {
            return;
        }
        let reason = match err {
            VerifyError::Expired { .. } => FailureReason::MessageExpired,
            _ => FailureReason::SignatureInvalid,
        };
        record.fail(reason, format!("{}: {err}", ctx.action), self.clock.now());
        self.correlator.release_transaction(ctx.transaction_id);
        audit_transition(&record);
        self.persist(&record);
    }

    fn apply_callback(
        &self,
        record: &mut Transaction,
        signed: &SignedEnvelope,
        verified: &VerifiedEnvelope,
        received_at: DateTime<Utc>,
    ) -> GatewayResult<CallbackOutcome> {
        let ctx = verified.context();
        let message = verified.message();
        let transitions_before = record.history.len();
        let provider = match (&ctx.bpp_id, &ctx.bpp_uri) {
            (Some(id), Some(uri)) => Participant {
                id: id.clone(),
                uri: uri.clone(),
            },
            _ => {
                return Err(GatewayError::MalformedEnvelope(format!(
                    "{} without bpp_id/bpp_uri",
                    ctx.action
                )))
            }
        };

        if ctx.action == Action::OnSearch
            && record
                .candidates
                .iter()
                .any(|c| c.provider.id == provider.id && c.message_id == ctx.message_id)
        {
            self.correlator
                .note_unmatched(ctx.message_id, UnmatchedReason::Duplicate);
            return Ok(drop_callback(record, ctx, UnmatchedReason::Duplicate, received_at));
        }

        record.messages.push(MessageRecord {
            message_id: ctx.message_id,
            action: ctx.action,
            direction: Direction::Inbound,
            at: received_at,
            sha256: digest(signed),
        });

        if let Some(error) = protocol_error(signed.raw(), message) {
            record.fail(
                FailureReason::CounterpartyError,
                format!("{} from {}: {error}", ctx.action, provider.id),
                received_at,
            );
            self.correlator.release_transaction(record.id);
            audit_transition(record);
            return Ok(CallbackOutcome::Applied {
                transaction_id: record.id,
                state: record.state,
            });
        }

        match ctx.action {
            Action::OnSearch => {
                debug!(
                    transaction_id = %record.id,
                    bpp_id = %provider.id,
                    "search result collected"
                );
                record.candidates.push(Candidate {
                    provider,
                    message_id: ctx.message_id,
                    received_at,
                    catalog: message.get("catalog").cloned().unwrap_or_else(|| message.clone()),
                });
            }
            Action::OnSelect => {
                record.bpp = Some(provider);
                record.quote = message.pointer("/order/quote").cloned();
                record.transition(
                    TransactionState::Selected,
                    received_at,
                    Some("on_select".into()),
                );
            }
            Action::OnInit => {
                record.transition(
                    TransactionState::Initiated,
                    received_at,
                    Some("on_init".into()),
                );
            }
            Action::OnConfirm => {
                record.care_context_id = first_string(message, &CARE_CONTEXT_POINTERS);
                record.order_id = first_string(message, &["/order/id"]);
                record.transition(
                    TransactionState::Confirmed,
                    received_at,
                    Some("on_confirm".into()),
                );
                self.correlator.release_transaction(record.id);
            }
            Action::OnStatus => {
                record.fulfillment_status = first_string(message, &FULFILLMENT_STATUS_POINTERS);
            }
            Action::OnCancel => {
                record.cancel_acknowledged = true;
            }
            other => {
                return Err(GatewayError::InvalidInput(format!(
                    "{other} is not a transaction callback"
                )))
            }
        }

        if record.history.len() > transitions_before {
            audit_transition(record);
        }
        Ok(CallbackOutcome::Applied {
            transaction_id: record.id,
            state: record.state,
        })
    }
}

fn ensure_state(
    record: &Transaction,
    action: Action,
    allowed: &[TransactionState],
) -> GatewayResult<()> {
    if allowed.contains(&record.state) {
        Ok(())
    } else {
        Err(GatewayError::invalid_state(
            "transaction",
            record.state,
            action.as_str(),
        ))
    }
}

/// Whether a callback may still be processed in `state`. `on_status` keeps working after
/// confirmation and `on_cancel` after cancellation; everything else stops at a terminal
/// state or a pending cancel.
fn accepts_callback(state: TransactionState, action: Action, cancelling: bool) -> bool {
    match (state, action) {
        (TransactionState::Cancelled, Action::OnCancel) => true,
        (TransactionState::Confirmed, Action::OnStatus) => !cancelling,
        (state, _) => !state.is_terminal() && !cancelling,
    }
}

fn drop_callback(
    record: &mut Transaction,
    ctx: &Context,
    reason: UnmatchedReason,
    at: DateTime<Utc>,
) -> CallbackOutcome {
    debug!(
        transaction_id = %record.id,
        message_id = %ctx.message_id,
        action = %ctx.action,
        reason = %reason,
        "callback dropped"
    );
    record.dropped.push(DroppedCallback {
        message_id: ctx.message_id,
        action: ctx.action,
        reason,
        at,
    });
    CallbackOutcome::Dropped {
        transaction_id: record.id,
        reason,
    }
}

/// Protocol error carried by a callback, either at the top level of the envelope or inside
/// the message.
fn protocol_error(raw: &Value, message: &Value) -> Option<String> {
    let error = raw
        .get("error")
        .or_else(|| message.get("error"))
        .filter(|e| !e.is_null())?;
    let code = error.get("code").and_then(Value::as_str);
    let text = error.get("message").and_then(Value::as_str);
    Some(match (code, text) {
        (Some(code), Some(text)) => format!("{code}: {text}"),
        (Some(only), None) | (None, Some(only)) => only.to_owned(),
        (None, None) => error.to_string(),
    })
}

fn first_string(message: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|p| message.pointer(p))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn digest(signed: &SignedEnvelope) -> String {
    hex::encode(Sha256::digest(signed.canonical_bytes()))
}

fn audit_transition(record: &Transaction) {
    if let Some(change) = record.history.last() {
        info!(
            target: AUDIT_TARGET,
            transaction_id = %record.id,
            from = %change.from,
            to = %change.to,
            failure = ?record.failure,
            cause = change.cause.as_deref().unwrap_or(""),
            "transaction transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::testing::{harness, harness_with, start};
    use crate::transaction::transport::{RecordingTransport, TransportError};
    use chrono::Duration;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use uhi_codec::{KeyId, SigningKeyPair, TrustedKeyRegistry};

    #[tokio::test]
    async fn full_exchange_reaches_confirmed() {
        let h = harness();
        let search = h
            .machine
            .search(json!({"intent": {"fulfillment": {"type": "Teleconsultation"}}}))
            .await
            .unwrap();
        let id = search.transaction_id;
        assert_eq!(h.state(id).await, TransactionState::Searching);

        for n in [0, 1, 0] {
            let cb = h.callback(n, &search, json!({"catalog": {"providers": [n]}}));
            h.machine.handle_callback(&cb).await.unwrap();
        }
        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.candidates.len(), 2);
        assert_eq!(snapshot.dropped.len(), 1);

        let bpp = h.providers[1].0.id.clone();
        let select = h.machine.select(id, &bpp, json!({"order": {}})).await.unwrap();
        let cb = h.callback(1, &select, json!({"order": {"quote": {"price": "700"}}}));
        h.machine.handle_callback(&cb).await.unwrap();
        assert_eq!(h.state(id).await, TransactionState::Selected);

        let init = h.machine.init(id, json!({"order": {}})).await.unwrap();
        h.machine
            .handle_callback(&h.callback(1, &init, json!({"order": {}})))
            .await
            .unwrap();
        assert_eq!(h.state(id).await, TransactionState::Initiated);

        let confirm = h.machine.confirm(id, json!({"order": {}})).await.unwrap();
        let outcome = h
            .machine
            .handle_callback(&h.callback(
                1,
                &confirm,
                json!({"order": {"id": "order-77", "care_context_id": "cc-2026-001"}}),
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Applied {
                transaction_id: id,
                state: TransactionState::Confirmed
            }
        );

        let status = h.machine.status(id, json!({"order": {"id": "order-77"}})).await.unwrap();
        h.machine
            .handle_callback(&h.callback(1, &status, json!({"order": {"state": "IN_PROGRESS"}})))
            .await
            .unwrap();

        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Confirmed);
        assert_eq!(snapshot.care_context_id.as_deref(), Some("cc-2026-001"));
        assert_eq!(snapshot.order_id.as_deref(), Some("order-77"));
        assert_eq!(snapshot.fulfillment_status.as_deref(), Some("IN_PROGRESS"));
        assert_eq!(snapshot.bpp.as_ref().map(|p| p.id.as_str()), Some(bpp.as_str()));

        confirm.delivery.await.unwrap();
        let sent = h.transport.sent().await;
        assert_eq!(sent[0].uri, "https://gateway.example.org/uhi");
        assert!(sent.iter().skip(1).all(|s| s.uri == h.providers[1].0.uri));
    }

    #[tokio::test]
    async fn duplicate_callback_applies_once() {
        let h = harness();
        let (participant, _) = h.providers[0].clone();
        let issued = h.machine.begin_select(participant, json!({"order": {}})).await.unwrap();
        let cb = h.callback(0, &issued, json!({"order": {}}));

        let first = h.machine.handle_callback(&cb).await.unwrap();
        let second = h.machine.handle_callback(&cb).await.unwrap();
        assert!(matches!(first, CallbackOutcome::Applied { .. }));
        assert_eq!(
            second,
            CallbackOutcome::Dropped {
                transaction_id: issued.transaction_id,
                reason: UnmatchedReason::Duplicate
            }
        );
        let snapshot = h.machine.snapshot(issued.transaction_id).await.unwrap();
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn one_request_outstanding_per_transaction() {
        let h = harness();
        let id = h.selected().await;
        h.machine.init(id, json!({"order": {}})).await.unwrap();

        let err = h.machine.status(id, json!({"order": {}})).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::DuplicateOutstanding { action: Action::Init, .. }
        ));
        let err = h.machine.confirm(id, json!({"order": {}})).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_wins_over_concurrent_confirmation() {
        let h = harness();
        let id = h.initiated().await;
        let confirm = h.machine.confirm(id, json!({"order": {}})).await.unwrap();
        let on_confirm = h.callback(0, &confirm, json!({"order": {"id": "order-1"}}));

        let (cancelled, callback) = tokio::join!(
            h.machine.cancel(id, json!({"reason": "patient request"})),
            h.machine.handle_callback(&on_confirm),
        );
        assert!(cancelled.unwrap().is_some());
        assert!(matches!(callback.unwrap(), CallbackOutcome::Dropped { .. }));

        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Cancelled);
        assert_eq!(snapshot.dropped.len(), 1);
        assert_eq!(snapshot.dropped[0].action, Action::OnConfirm);

        // Re-delivery after the fact is still dropped.
        let again = h.machine.handle_callback(&on_confirm).await.unwrap();
        assert!(matches!(again, CallbackOutcome::Dropped { .. }));
        assert_eq!(h.state(id).await, TransactionState::Cancelled);
    }

    #[tokio::test]
    async fn on_cancel_is_acknowledged_after_cancel() {
        let h = harness();
        let id = h.selected().await;
        let issued = h.machine.cancel(id, json!({})).await.unwrap().unwrap();
        let ack = h.callback(0, &issued, json!({"order": {"state": "CANCELLED"}}));
        h.machine.handle_callback(&ack).await.unwrap();

        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert!(snapshot.cancel_acknowledged);
        assert!(h.machine.cancel(id, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn silent_provider_times_out_exactly_once() {
        let h = harness_with(|c| c.with_default_ttl(StdDuration::from_secs(5)).unwrap());
        let (participant, _) = h.providers[0].clone();
        let issued = h.machine.begin_select(participant, json!({"order": {}})).await.unwrap();
        let id = issued.transaction_id;

        assert!(h.machine.sweep(start() + Duration::seconds(4)).await.timed_out.is_empty());
        let report = h.machine.sweep(start() + Duration::seconds(6)).await;
        assert_eq!(report.timed_out, vec![id]);
        assert!(h.machine.sweep(start() + Duration::seconds(7)).await.timed_out.is_empty());

        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Failed);
        assert_eq!(snapshot.failure, Some(FailureReason::Timeout));
        let failures = snapshot
            .history
            .iter()
            .filter(|c| c.to == TransactionState::Failed)
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn tampered_callback_fails_the_transaction() {
        let h = harness();
        let (participant, _) = h.providers[0].clone();
        let issued = h.machine.begin_select(participant, json!({"order": {}})).await.unwrap();
        let cb = h.callback(0, &issued, json!({"order": {"quote": {"price": "500"}}}));

        let mut raw = cb.raw().clone();
        raw["message"]["order"]["quote"]["price"] = json!("5");
        let tampered = SignedEnvelope::from_value(raw).unwrap();

        let err = h.machine.handle_callback(&tampered).await.unwrap_err();
        assert!(matches!(err, GatewayError::SignatureInvalid(_)));
        let snapshot = h.machine.snapshot(issued.transaction_id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Failed);
        assert_eq!(snapshot.failure, Some(FailureReason::SignatureInvalid));

        // The genuine callback arriving later changes nothing.
        let late = h.machine.handle_callback(&cb).await.unwrap();
        assert!(matches!(late, CallbackOutcome::Dropped { .. }));
    }

    #[tokio::test]
    async fn unsolicited_bad_signature_is_only_rejected() {
        let h = harness();
        let id = h.selected().await;
        let issued = h.machine.init(id, json!({"order": {}})).await.unwrap();
        let mut cb = h.callback(0, &issued, json!({"order": {}})).raw().clone();
        cb["context"]["message_id"] = json!(MessageId::new());
        let forged = SignedEnvelope::from_value(cb).unwrap();

        assert!(h.machine.handle_callback(&forged).await.is_err());
        assert_eq!(h.state(id).await, TransactionState::Selected);
    }

    #[tokio::test]
    async fn counterparty_error_fails_the_transaction() {
        let h = harness();
        let id = h.selected().await;
        let issued = h.machine.init(id, json!({"order": {}})).await.unwrap();
        let cb = h.callback(
            0,
            &issued,
            json!({"error": {"code": "30004", "message": "slot no longer available"}}),
        );
        h.machine.handle_callback(&cb).await.unwrap();

        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.failure, Some(FailureReason::CounterpartyError));
        assert!(snapshot
            .failure_detail
            .unwrap()
            .contains("slot no longer available"));
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_request_fails_with_timeout() {
        let h = harness_with(|c| {
            c.with_retry(RetryPolicy {
                max_attempts: 2,
                initial_backoff: StdDuration::from_millis(10),
                max_backoff: StdDuration::from_millis(10),
            })
        });
        h.transport
            .fail_all(Some(TransportError::Unreachable("connection refused".into())))
            .await;
        let (participant, _) = h.providers[0].clone();
        let issued = h.machine.begin_select(participant, json!({"order": {}})).await.unwrap();
        let id = issued.transaction_id;

        let outcome = issued.delivery.await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Exhausted { attempts: 2, .. }));
        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.failure, Some(FailureReason::Timeout));
        assert!(h.machine.correlator().outstanding(id).is_empty());
    }

    #[tokio::test]
    async fn search_window_closes_then_transaction_expires() {
        let h = harness_with(|c| {
            c.with_search_window(StdDuration::from_secs(10))
                .with_transaction_ttl(StdDuration::from_secs(60))
        });
        let search = h.machine.search(json!({"intent": {}})).await.unwrap();
        let id = search.transaction_id;

        let report = h.machine.sweep(start() + Duration::seconds(11)).await;
        assert_eq!(report.windows_closed, vec![id]);
        assert_eq!(h.state(id).await, TransactionState::Searching);

        let report = h.machine.sweep(start() + Duration::seconds(61)).await;
        assert_eq!(report.expired, vec![id]);
        assert_eq!(h.state(id).await, TransactionState::Expired);
    }

    #[tokio::test]
    async fn cancel_without_provider_is_local() {
        let h = harness();
        let search = h.machine.search(json!({"intent": {}})).await.unwrap();
        let issued = h.machine.cancel(search.transaction_id, json!({})).await.unwrap();
        assert!(issued.is_none());
        assert_eq!(h.state(search.transaction_id).await, TransactionState::Cancelled);
        assert!(h
            .machine
            .correlator()
            .outstanding(search.transaction_id)
            .is_empty());
    }

    #[tokio::test]
    async fn search_requires_gateway() {
        let clock = Arc::new(ManualClock::new(start()));
        let config = Arc::new(
            CoreConfig::new("bap.example.org".into(), "https://bap.example.org/uhi".into())
                .unwrap(),
        );
        let key = Arc::new(SigningKeyPair::from_seed(
            KeyId::new("bap.example.org", "k1").unwrap(),
            &[1; 32],
        ));
        let machine = Arc::new(TransactionMachine::new(
            config,
            clock.clone(),
            Signer::new(key),
            Verifier::new(Arc::new(TrustedKeyRegistry::new())),
            Arc::new(RecordingTransport::new()),
            Arc::new(Correlator::new(clock)),
        ));
        let err = machine.search(json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::PreconditionFailed(_)));
        assert!(machine.is_empty());
    }

    #[tokio::test]
    async fn transactions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_path_buf();
        let id = {
            let h = harness_with(|c| c.with_data_dir(data.clone()));
            h.confirmed().await
        };

        let h = harness_with(|c| c.with_data_dir(data.clone()));
        assert_eq!(h.machine.len(), 1);
        let snapshot = h.machine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Confirmed);
        assert_eq!(snapshot.order_id.as_deref(), Some("order-1"));
        assert_eq!(snapshot.care_context_id.as_deref(), Some("cc-1"));
    }

    #[tokio::test]
    async fn settled_transactions_leave_memory_but_stay_readable() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness_with(|c| {
            c.with_data_dir(dir.path().to_path_buf())
                .with_settled_retention(StdDuration::from_secs(60))
        });
        let settled = h.confirmed().await;
        let open = h.selected().await;

        let report = h.machine.sweep(h.clock.now() + Duration::seconds(59)).await;
        assert!(report.evicted.is_empty());
        let report = h.machine.sweep(h.clock.now() + Duration::seconds(60)).await;
        assert_eq!(report.evicted, vec![settled]);
        assert_eq!(h.machine.len(), 1);

        assert_eq!(h.state(settled).await, TransactionState::Confirmed);
        assert_eq!(h.state(open).await, TransactionState::Selected);
    }
}
