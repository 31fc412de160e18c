//! Callback correlator.
//!
//! Maps outstanding outbound requests to the callbacks that answer them. A ticket is keyed
//! twice: by `(transaction_id, action)`, which enforces a single outstanding request per
//! action, and by `message_id`, which is what an inbound callback carries.
//!
//! Flow:
//! 1. The transaction machine signs a request and calls [`Correlator::register`].
//! 2. The inbound handler verifies a callback and calls [`Correlator::resolve`].
//! 3. A periodic tick calls [`Correlator::sweep`], which hands back every ticket whose
//!    deadline has passed so the machine can time the transaction out.
//!
//! Resolving never fails: late, duplicate and spoofed callbacks come back as
//! [`Resolution::Unmatched`] with a reason.

use crate::clock::Clock;
use crate::constants::RESOLVED_RETENTION_SECS;
use crate::store::YamlStore;
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uhi_codec::{Action, Context};
use uhi_uuid::{MessageId, TransactionId};

/// How many callbacks a ticket accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Exactly one callback resolves the ticket.
    Single,
    /// Any number of callbacks until the window elapses or the ticket is closed.
    Collecting,
}

impl TicketKind {
    pub fn for_action(action: Action) -> Self {
        match action {
            Action::Search => TicketKind::Collecting,
            _ => TicketKind::Single,
        }
    }
}

/// A pending callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub transaction_id: TransactionId,
    /// The request action; the expected callback is `action.callback()`.
    pub action: Action,
    pub message_id: MessageId,
    pub kind: TicketKind,
    pub registered_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Participant expected to answer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// No ticket was ever registered for the message id.
    UnknownMessage,
    /// The message id belongs to a different transaction.
    WrongTransaction,
    /// The callback action does not answer the ticket's request.
    WrongAction,
    /// Sent by a participant other than the one the request went to.
    WrongCounterparty,
    /// Arrived after the ticket's deadline.
    Late,
    /// The ticket was already resolved by an earlier callback.
    Duplicate,
    /// The ticket was closed, released or timed out.
    Closed,
    /// The transaction is terminal or a cancel is in progress.
    Terminal,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnmatchedReason::UnknownMessage => "unknown_message",
            UnmatchedReason::WrongTransaction => "wrong_transaction",
            UnmatchedReason::WrongAction => "wrong_action",
            UnmatchedReason::WrongCounterparty => "wrong_counterparty",
            UnmatchedReason::Late => "late",
            UnmatchedReason::Duplicate => "duplicate",
            UnmatchedReason::Closed => "closed",
            UnmatchedReason::Terminal => "terminal",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Matched(Ticket),
    Unmatched(UnmatchedReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Retired {
    Resolved,
    Closed,
    TimedOut,
}

/// Statistics for the correlator.
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    pub registered: AtomicU64,
    pub matched: AtomicU64,
    pub unmatched: AtomicU64,
    pub timed_out: AtomicU64,
}

/// Point-in-time copy of [`CorrelatorStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub timed_out: u64,
    pub outstanding: u64,
}

#[derive(Debug)]
pub struct Correlator {
    by_key: DashMap<(TransactionId, Action), Ticket>,
    by_message: DashMap<MessageId, (TransactionId, Action)>,
    retired: DashMap<MessageId, (Retired, DateTime<Utc>)>,
    store: Option<YamlStore<Ticket>>,
    clock: Arc<dyn Clock>,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            by_key: DashMap::new(),
            by_message: DashMap::new(),
            retired: DashMap::new(),
            store: None,
            clock,
            stats: CorrelatorStats::default(),
        }
    }

    /// Correlator persisted under `dir`. Tickets stored by a previous run are reloaded so
    /// the next sweep still times out counterparties that never answered.
    pub fn open(clock: Arc<dyn Clock>, dir: PathBuf) -> GatewayResult<Self> {
        let store: YamlStore<Ticket> = YamlStore::open(dir)?;
        let mut correlator = Self::new(clock);
        for ticket in store.load_all() {
            correlator
                .by_message
                .insert(ticket.message_id, (ticket.transaction_id, ticket.action));
            correlator
                .by_key
                .insert((ticket.transaction_id, ticket.action), ticket);
        }
        tracing::info!(
            outstanding = correlator.by_key.len(),
            dir = %store.root().display(),
            "correlator tickets loaded"
        );
        correlator.store = Some(store);
        Ok(correlator)
    }

    /// Records a pending callback for `(transaction_id, action)`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::DuplicateOutstanding`] if a ticket for the same pair exists
    /// - [`GatewayError::Storage`] if the ticket cannot be persisted
    pub fn register(
        &self,
        transaction_id: TransactionId,
        action: Action,
        message_id: MessageId,
        deadline: DateTime<Utc>,
        counterparty: Option<String>,
    ) -> GatewayResult<Ticket> {
        match self.by_key.entry((transaction_id, action)) {
            Entry::Occupied(_) => {
                debug!(
                    transaction_id = %transaction_id,
                    action = %action,
                    "ticket already outstanding"
                );
                Err(GatewayError::DuplicateOutstanding {
                    transaction_id,
                    action,
                })
            }
            Entry::Vacant(slot) => {
                let ticket = Ticket {
                    transaction_id,
                    action,
                    message_id,
                    kind: TicketKind::for_action(action),
                    registered_at: self.clock.now(),
                    deadline,
                    counterparty,
                };
                self.persist(&ticket)?;
                self.by_message.insert(message_id, (transaction_id, action));
                slot.insert(ticket.clone());
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    transaction_id = %transaction_id,
                    action = %action,
                    message_id = %message_id,
                    deadline = %deadline,
                    "registered ticket"
                );
                Ok(ticket)
            }
        }
    }

    /// Matches an inbound callback (already verified) to its ticket.
    ///
    /// A single-response ticket is consumed by the first match. A collecting ticket stays
    /// registered. A late callback leaves its ticket in place for the sweep.
    pub fn resolve(&self, message_id: MessageId, callback: &Context) -> Resolution {
        let resolution = self.match_ticket(message_id, callback);
        match &resolution {
            Resolution::Matched(ticket) => {
                self.stats.matched.fetch_add(1, Ordering::Relaxed);
                debug!(
                    transaction_id = %ticket.transaction_id,
                    action = %callback.action,
                    message_id = %message_id,
                    "callback matched"
                );
            }
            Resolution::Unmatched(reason) => self.note_unmatched(message_id, *reason),
        }
        resolution
    }

    fn match_ticket(&self, message_id: MessageId, callback: &Context) -> Resolution {
        let Some(key) = self.by_message.get(&message_id).map(|k| *k) else {
            return Resolution::Unmatched(self.retired_reason(message_id));
        };
        let (transaction_id, action) = key;
        if callback.transaction_id != transaction_id {
            return Resolution::Unmatched(UnmatchedReason::WrongTransaction);
        }
        if callback.action.request() != Some(action) {
            return Resolution::Unmatched(UnmatchedReason::WrongAction);
        }
        let Some(ticket) = self.by_key.get(&key).map(|t| t.clone()) else {
            return Resolution::Unmatched(self.retired_reason(message_id));
        };
        if let Some(expected) = &ticket.counterparty {
            if callback.bpp_id.as_deref() != Some(expected.as_str()) {
                return Resolution::Unmatched(UnmatchedReason::WrongCounterparty);
            }
        }
        if self.clock.now() > ticket.deadline {
            return Resolution::Unmatched(UnmatchedReason::Late);
        }

        match ticket.kind {
            TicketKind::Collecting => Resolution::Matched(ticket),
            TicketKind::Single => match self.take(message_id, Retired::Resolved) {
                Some(ticket) => Resolution::Matched(ticket),
                // Lost the race to another callback, a close or the sweep.
                None => Resolution::Unmatched(self.retired_reason(message_id)),
            },
        }
    }

    /// Counts and logs a callback that was dropped without reaching a ticket.
    pub fn note_unmatched(&self, message_id: MessageId, reason: UnmatchedReason) {
        self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %message_id, reason = %reason, "callback unmatched");
    }

    /// Ticket for `message_id`, without consuming it.
    pub fn peek(&self, message_id: MessageId) -> Option<Ticket> {
        let key = self.by_message.get(&message_id).map(|k| *k)?;
        self.by_key.get(&key).map(|t| t.clone())
    }

    pub fn get(&self, transaction_id: TransactionId, action: Action) -> Option<Ticket> {
        self.by_key
            .get(&(transaction_id, action))
            .map(|t| t.clone())
    }

    /// Removes the ticket for `(transaction_id, action)`, e.g. to close a search window
    /// early.
    pub fn close(&self, transaction_id: TransactionId, action: Action) -> Option<Ticket> {
        let message_id = self.by_key.get(&(transaction_id, action))?.message_id;
        self.take(message_id, Retired::Closed)
    }

    /// Removes the ticket registered under `message_id`. Only one caller ever receives a
    /// given ticket back.
    pub fn close_message(&self, message_id: MessageId) -> Option<Ticket> {
        self.take(message_id, Retired::Closed)
    }

    /// Removes every ticket of a transaction.
    pub fn release_transaction(&self, transaction_id: TransactionId) -> Vec<Ticket> {
        self.outstanding(transaction_id)
            .into_iter()
            .filter_map(|t| self.take(t.message_id, Retired::Closed))
            .collect()
    }

    pub fn outstanding(&self, transaction_id: TransactionId) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .by_key
            .iter()
            .filter(|t| t.transaction_id == transaction_id)
            .map(|t| t.clone())
            .collect();
        tickets.sort_by_key(|t| t.registered_at);
        tickets
    }

    /// Removes and returns every ticket whose deadline is at or before `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Ticket> {
        let due: Vec<MessageId> = self
            .by_key
            .iter()
            .filter(|t| t.deadline <= now)
            .map(|t| t.message_id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for message_id in due {
            if let Some(ticket) = self.take(message_id, Retired::TimedOut) {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    transaction_id = %ticket.transaction_id,
                    action = %ticket.action,
                    message_id = %message_id,
                    deadline = %ticket.deadline,
                    "ticket deadline passed"
                );
                expired.push(ticket);
            }
        }

        let horizon = now - Duration::seconds(RESOLVED_RETENTION_SECS);
        self.retired.retain(|_, (_, at)| *at > horizon);
        expired
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn stats(&self) -> &CorrelatorStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.stats.registered.load(Ordering::Relaxed),
            matched: self.stats.matched.load(Ordering::Relaxed),
            unmatched: self.stats.unmatched.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            outstanding: self.by_key.len() as u64,
        }
    }

    /// Atomically removes the ticket for `message_id`. Removal from `by_message` decides
    /// the single winner among concurrent resolvers, closers and the sweep.
    fn take(&self, message_id: MessageId, why: Retired) -> Option<Ticket> {
        let (_, key) = self.by_message.remove(&message_id)?;
        let (_, ticket) = self
            .by_key
            .remove_if(&key, |_, t| t.message_id == message_id)?;
        self.retired.insert(message_id, (why, self.clock.now()));
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&message_id.shardable()) {
                warn!(message_id = %message_id, error = %e, "failed to remove stored ticket");
            }
        }
        Some(ticket)
    }

    fn retired_reason(&self, message_id: MessageId) -> UnmatchedReason {
        match self.retired.get(&message_id).map(|r| r.0) {
            Some(Retired::Resolved) => UnmatchedReason::Duplicate,
            Some(Retired::Closed) => UnmatchedReason::Closed,
            Some(Retired::TimedOut) => UnmatchedReason::Late,
            None => UnmatchedReason::UnknownMessage,
        }
    }

    fn persist(&self, ticket: &Ticket) -> GatewayResult<()> {
        match &self.store {
            Some(store) => store.save(&ticket.message_id.shardable(), ticket),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn start() -> DateTime<Utc> {
        "2026-02-01T10:00:00Z".parse().unwrap()
    }

    fn correlator() -> (Arc<ManualClock>, Correlator) {
        let clock = Arc::new(ManualClock::new(start()));
        (clock.clone(), Correlator::new(clock))
    }

    fn callback(transaction_id: TransactionId, message_id: MessageId, action: Action) -> Context {
        Context {
            domain: "nic2004:85111".into(),
            action,
            transaction_id,
            message_id,
            bap_id: "bap.example.org".into(),
            bap_uri: "https://bap.example.org/uhi".into(),
            bpp_id: Some("bpp.example.org".into()),
            bpp_uri: Some("https://bpp.example.org/uhi".into()),
            timestamp: start(),
            ttl: 30,
            signature: None,
        }
    }

    #[test]
    fn second_register_for_same_pair_is_rejected() {
        let (_, correlator) = correlator();
        let tx = TransactionId::new();
        let deadline = start() + Duration::seconds(5);
        correlator
            .register(tx, Action::Select, MessageId::new(), deadline, None)
            .unwrap();
        let err = correlator
            .register(tx, Action::Select, MessageId::new(), deadline, None)
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::DuplicateOutstanding { action: Action::Select, .. }
        ));
        // A different action on the same transaction is its own slot.
        correlator
            .register(tx, Action::Status, MessageId::new(), deadline, None)
            .unwrap();
    }

    #[test]
    fn single_ticket_resolves_once() {
        let (_, correlator) = correlator();
        let tx = TransactionId::new();
        let msg = MessageId::new();
        correlator
            .register(tx, Action::Confirm, msg, start() + Duration::seconds(5), None)
            .unwrap();

        let cb = callback(tx, msg, Action::OnConfirm);
        assert!(matches!(correlator.resolve(msg, &cb), Resolution::Matched(_)));
        assert_eq!(
            correlator.resolve(msg, &cb),
            Resolution::Unmatched(UnmatchedReason::Duplicate)
        );
        let stats = correlator.stats_snapshot();
        assert_eq!((stats.matched, stats.unmatched, stats.outstanding), (1, 1, 0));
    }

    #[test]
    fn spoofed_callbacks_are_unmatched() {
        let (_, correlator) = correlator();
        let tx = TransactionId::new();
        let msg = MessageId::new();
        correlator
            .register(
                tx,
                Action::Init,
                msg,
                start() + Duration::seconds(5),
                Some("bpp.example.org".into()),
            )
            .unwrap();

        let unknown = MessageId::new();
        assert_eq!(
            correlator.resolve(unknown, &callback(tx, unknown, Action::OnInit)),
            Resolution::Unmatched(UnmatchedReason::UnknownMessage)
        );
        assert_eq!(
            correlator.resolve(msg, &callback(TransactionId::new(), msg, Action::OnInit)),
            Resolution::Unmatched(UnmatchedReason::WrongTransaction)
        );
        assert_eq!(
            correlator.resolve(msg, &callback(tx, msg, Action::OnConfirm)),
            Resolution::Unmatched(UnmatchedReason::WrongAction)
        );
        let mut other = callback(tx, msg, Action::OnInit);
        other.bpp_id = Some("rogue.example.org".into());
        assert_eq!(
            correlator.resolve(msg, &other),
            Resolution::Unmatched(UnmatchedReason::WrongCounterparty)
        );
        // None of the above consumed the ticket.
        assert!(matches!(
            correlator.resolve(msg, &callback(tx, msg, Action::OnInit)),
            Resolution::Matched(_)
        ));
    }

    #[test]
    fn collecting_ticket_accepts_many_callbacks_until_closed() {
        let (_, correlator) = correlator();
        let tx = TransactionId::new();
        let msg = MessageId::new();
        let ticket = correlator
            .register(tx, Action::Search, msg, start() + Duration::seconds(10), None)
            .unwrap();
        assert_eq!(ticket.kind, TicketKind::Collecting);

        let cb = callback(tx, msg, Action::OnSearch);
        assert!(matches!(correlator.resolve(msg, &cb), Resolution::Matched(_)));
        assert!(matches!(correlator.resolve(msg, &cb), Resolution::Matched(_)));

        assert!(correlator.close(tx, Action::Search).is_some());
        assert_eq!(
            correlator.resolve(msg, &cb),
            Resolution::Unmatched(UnmatchedReason::Closed)
        );
    }

    #[test]
    fn sweep_returns_each_expired_ticket_once() {
        let (clock, correlator) = correlator();
        let tx = TransactionId::new();
        let msg = MessageId::new();
        correlator
            .register(tx, Action::Select, msg, start() + Duration::seconds(5), None)
            .unwrap();

        assert!(correlator.sweep(start() + Duration::seconds(4)).is_empty());
        let expired = correlator.sweep(start() + Duration::seconds(6));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, msg);
        assert!(correlator.sweep(start() + Duration::seconds(7)).is_empty());

        clock.advance(Duration::seconds(7));
        assert_eq!(
            correlator.resolve(msg, &callback(tx, msg, Action::OnSelect)),
            Resolution::Unmatched(UnmatchedReason::Late)
        );
        assert_eq!(correlator.stats_snapshot().timed_out, 1);
    }

    #[test]
    fn late_callback_leaves_ticket_for_sweep() {
        let (clock, correlator) = correlator();
        let tx = TransactionId::new();
        let msg = MessageId::new();
        correlator
            .register(tx, Action::Select, msg, start() + Duration::seconds(5), None)
            .unwrap();
        clock.advance(Duration::seconds(6));
        assert_eq!(
            correlator.resolve(msg, &callback(tx, msg, Action::OnSelect)),
            Resolution::Unmatched(UnmatchedReason::Late)
        );
        assert_eq!(correlator.sweep(clock.now()).len(), 1);
    }

    #[test]
    fn release_transaction_drops_all_tickets() {
        let (_, correlator) = correlator();
        let tx = TransactionId::new();
        let deadline = start() + Duration::seconds(5);
        correlator
            .register(tx, Action::Select, MessageId::new(), deadline, None)
            .unwrap();
        correlator
            .register(tx, Action::Status, MessageId::new(), deadline, None)
            .unwrap();
        correlator
            .register(TransactionId::new(), Action::Select, MessageId::new(), deadline, None)
            .unwrap();

        assert_eq!(correlator.release_transaction(tx).len(), 2);
        assert!(correlator.outstanding(tx).is_empty());
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn tickets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let tx = TransactionId::new();
        let msg = MessageId::new();
        {
            let correlator = Correlator::open(clock.clone(), dir.path().join("tickets")).unwrap();
            correlator
                .register(tx, Action::Select, msg, start() + Duration::seconds(5), None)
                .unwrap();
        }

        let reopened = Correlator::open(clock, dir.path().join("tickets")).unwrap();
        assert_eq!(reopened.peek(msg).map(|t| t.transaction_id), Some(tx));
        assert_eq!(reopened.sweep(start() + Duration::seconds(6)).len(), 1);
        assert!(reopened.is_empty());
    }
}
