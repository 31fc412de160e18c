//! Claims adapter.
//!
//! Drives pre-authorisation and claim submission against the claims exchange once a
//! transaction is confirmed. The adapter reads transaction state, the bundle registry and
//! the consent ledger but never writes them. It owns [`ClaimCase`] records, whose status
//! only moves forward:
//!
//! ```text
//! preauth_requested -> preauth_approved -> claim_submitted -> claim_approved -> paid
//!                   \-> preauth_denied                     \-> claim_denied
//! ```
//!
//! A denied case is final; trying again needs a new case.
//!
//! Clinical bundles only leave the gateway under a granted consent covering the
//! transaction's provider and care context. The consent is re-checked for every request,
//! and a revoke stops any delivery still in progress.
//!
//! The exchange answers a case's latest request on the request's message id. The answer is
//! applied whenever the case is still waiting on it, even after the callback ticket has
//! timed out, and a payment notice may follow a claim approval on the same message id.

use crate::bundles::BundleRegistry;
use crate::clock::{after, Clock};
use crate::config::CoreConfig;
use crate::consent::{ConsentLedger, FetchGuard, HiType, ReleaseRequest};
use crate::correlator::{Correlator, Resolution, Ticket, UnmatchedReason};
use crate::store::YamlStore;
use crate::transaction::{deliver, Transaction, TransactionMachine, TransactionState, Transport};
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uhi_codec::{
    Action, Context, Envelope, SignedEnvelope, Signer, Verifier, AUDIT_TARGET, MAX_TTL_SECS,
};
use uhi_types::Amount;
use uhi_uuid::{BundleId, ClaimId, ConsentId, MessageId, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    PreauthRequested,
    PreauthApproved,
    PreauthDenied,
    ClaimSubmitted,
    ClaimApproved,
    ClaimDenied,
    Paid,
}

impl ClaimStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClaimStatus::PreauthDenied | ClaimStatus::ClaimDenied | ClaimStatus::Paid
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::PreauthRequested => "preauth_requested",
            ClaimStatus::PreauthApproved => "preauth_approved",
            ClaimStatus::PreauthDenied => "preauth_denied",
            ClaimStatus::ClaimSubmitted => "claim_submitted",
            ClaimStatus::ClaimApproved => "claim_approved",
            ClaimStatus::ClaimDenied => "claim_denied",
            ClaimStatus::Paid => "paid",
        }
    }

    /// The exchange callback a case in this status is waiting for.
    fn awaited_callback(&self) -> Option<Action> {
        match self {
            ClaimStatus::PreauthRequested => Some(Action::OnPreauthSubmit),
            ClaimStatus::ClaimSubmitted | ClaimStatus::ClaimApproved => {
                Some(Action::OnClaimSubmit)
            }
            _ => None,
        }
    }

    /// Status reached by recording `outcome`, or `None` if it does not follow from here.
    fn after_outcome(&self, outcome: &AdjudicationOutcome) -> Option<ClaimStatus> {
        match (self, outcome) {
            (ClaimStatus::PreauthRequested, AdjudicationOutcome::Approved) => {
                Some(ClaimStatus::PreauthApproved)
            }
            (ClaimStatus::PreauthRequested, AdjudicationOutcome::Denied { .. }) => {
                Some(ClaimStatus::PreauthDenied)
            }
            (ClaimStatus::ClaimSubmitted, AdjudicationOutcome::Approved) => {
                Some(ClaimStatus::ClaimApproved)
            }
            (ClaimStatus::ClaimSubmitted, AdjudicationOutcome::Denied { .. }) => {
                Some(ClaimStatus::ClaimDenied)
            }
            (ClaimStatus::ClaimApproved, AdjudicationOutcome::Paid) => Some(ClaimStatus::Paid),
            _ => None,
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the claims exchange decided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdjudicationOutcome {
    Approved,
    Denied { reason: String },
    Paid,
}

impl AdjudicationOutcome {
    /// Reads `{"claim": {"outcome": "...", "reason": "..."}}` from a callback message.
    fn from_message(message: &Value) -> GatewayResult<Self> {
        let claim = message.get("claim").ok_or_else(|| {
            GatewayError::MalformedEnvelope("claims callback without message.claim".into())
        })?;
        match claim.get("outcome").and_then(Value::as_str) {
            Some("approved") => Ok(AdjudicationOutcome::Approved),
            Some("paid") => Ok(AdjudicationOutcome::Paid),
            Some("denied") => Ok(AdjudicationOutcome::Denied {
                reason: claim
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason given")
                    .to_owned(),
            }),
            Some(other) => Err(GatewayError::MalformedEnvelope(format!(
                "unknown claim outcome '{other}'"
            ))),
            None => Err(GatewayError::MalformedEnvelope(
                "message.claim.outcome is missing".into(),
            )),
        }
    }
}

/// The consent a claim's clinical bundles are released under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimConsent {
    pub consent_id: ConsentId,
    pub hi_type: HiType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTransition {
    pub from: ClaimStatus,
    pub to: ClaimStatus,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCase {
    pub id: ClaimId,
    pub transaction_id: TransactionId,
    pub status: ClaimStatus,
    pub amount: Amount,
    pub consent_id: ConsentId,
    /// What each request to the exchange releases, checked against the consent.
    pub release: ReleaseRequest,
    pub bundle_ids: Vec<BundleId>,
    #[serde(default)]
    pub supporting_bundle_ids: Vec<BundleId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    /// Message awaiting a claims-exchange callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_message_id: Option<MessageId>,
    #[serde(default)]
    pub history: Vec<ClaimTransition>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ClaimCase {
    fn advance(&mut self, to: ClaimStatus, at: DateTime<Utc>) {
        self.history.push(ClaimTransition {
            from: self.status,
            to,
            at,
        });
        self.status = to;
        self.updated_at = at;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimCallbackOutcome {
    Applied(ClaimCase),
    Dropped(UnmatchedReason),
}

#[derive(Debug)]
pub struct ClaimsAdapter {
    machine: Arc<TransactionMachine>,
    bundles: Arc<BundleRegistry>,
    consents: Arc<ConsentLedger>,
    signer: Signer,
    verifier: Verifier,
    transport: Arc<dyn Transport>,
    cases: DashMap<ClaimId, ClaimCase>,
    by_message: DashMap<MessageId, ClaimId>,
    store: Option<YamlStore<ClaimCase>>,
}

impl ClaimsAdapter {
    pub fn new(
        machine: Arc<TransactionMachine>,
        bundles: Arc<BundleRegistry>,
        consents: Arc<ConsentLedger>,
        signer: Signer,
        verifier: Verifier,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            machine,
            bundles,
            consents,
            signer,
            verifier,
            transport,
            cases: DashMap::new(),
            by_message: DashMap::new(),
            store: None,
        }
    }

    /// Adapter persisted under `dir`. Open cases, and settled ones still inside the
    /// retention window, are reloaded together with the messages they are waiting on.
    pub fn open(
        machine: Arc<TransactionMachine>,
        bundles: Arc<BundleRegistry>,
        consents: Arc<ConsentLedger>,
        signer: Signer,
        verifier: Verifier,
        transport: Arc<dyn Transport>,
        dir: PathBuf,
    ) -> GatewayResult<Self> {
        let store: YamlStore<ClaimCase> = YamlStore::open(dir)?;
        let mut adapter = Self::new(machine, bundles, consents, signer, verifier, transport);
        let now = adapter.clock().now();
        for case in store.load_all() {
            if adapter.is_evictable(&case, now) {
                continue;
            }
            if let Some(message_id) = case.pending_message_id {
                adapter.by_message.insert(message_id, case.id);
            }
            adapter.cases.insert(case.id, case);
        }
        info!(
            count = adapter.cases.len(),
            dir = %store.root().display(),
            "claim cases loaded"
        );
        adapter.store = Some(store);
        Ok(adapter)
    }

    fn config(&self) -> &Arc<CoreConfig> {
        self.machine.config()
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.machine.clock()
    }

    fn correlator(&self) -> &Arc<Correlator> {
        self.machine.correlator()
    }

    /// Opens a claim case and sends the pre-authorisation request.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::PreconditionFailed`] unless the transaction is confirmed, at least
    ///   one bundle is given, every bundle passed validation and a claims exchange is
    ///   configured
    /// - [`GatewayError::ConsentDenied`] unless `consent` currently allows releasing the
    ///   transaction's records to the exchange
    ///
    /// No case is created on error.
    pub async fn request_preauth(
        &self,
        transaction_id: TransactionId,
        consent: ClaimConsent,
        bundle_ids: Vec<BundleId>,
        amount: Amount,
    ) -> GatewayResult<ClaimCase> {
        let transaction = self.machine.snapshot(transaction_id).await.ok_or_else(|| {
            GatewayError::PreconditionFailed(format!("unknown transaction {transaction_id}"))
        })?;
        if transaction.state != TransactionState::Confirmed {
            return Err(GatewayError::PreconditionFailed(format!(
                "transaction {transaction_id} is {}; pre-authorisation needs a confirmed transaction",
                transaction.state
            )));
        }
        if bundle_ids.is_empty() {
            return Err(GatewayError::PreconditionFailed(
                "pre-authorisation needs at least one clinical bundle".into(),
            ));
        }
        self.ensure_registered(&bundle_ids)?;
        let release = release_for(&transaction, consent.hi_type)?;
        let guard = self.consents.begin_fetch(consent.consent_id, release.clone())?;

        let claim_id = ClaimId::new();
        let message = json!({
            "claim": {
                "id": claim_id,
                "use": "preauthorization",
                "transaction_id": transaction_id,
                "order_id": transaction.order_id,
                "care_context_id": transaction.care_context_id,
                "consent_id": consent.consent_id,
                "total": amount,
                "bundles": self.bundle_refs(&bundle_ids),
            }
        });
        let message_id = self.send(transaction_id, Action::PreauthSubmit, message, guard)?;

        let now = self.clock().now();
        let case = ClaimCase {
            id: claim_id,
            transaction_id,
            status: ClaimStatus::PreauthRequested,
            amount,
            consent_id: consent.consent_id,
            release,
            bundle_ids,
            supporting_bundle_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            denial_reason: None,
            pending_message_id: Some(message_id),
            history: Vec::new(),
            notes: Vec::new(),
        };
        self.by_message.insert(message_id, claim_id);
        self.persist(&case);
        self.cases.insert(claim_id, case.clone());
        info!(
            target: AUDIT_TARGET,
            claim_id = %claim_id,
            transaction_id = %transaction_id,
            consent_id = %consent.consent_id,
            amount = %case.amount,
            "pre-authorisation requested"
        );
        Ok(case)
    }

    /// Submits the claim for an approved pre-authorisation.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] for an unknown case
    /// - [`GatewayError::InvalidState`] unless the case is `preauth_approved`
    /// - [`GatewayError::PreconditionFailed`] if a supporting bundle was never validated
    /// - [`GatewayError::ConsentDenied`] if the case's consent no longer allows the release
    pub fn submit_claim(
        &self,
        claim_id: ClaimId,
        supporting_bundle_ids: Vec<BundleId>,
    ) -> GatewayResult<ClaimCase> {
        let mut case = self
            .cases
            .get_mut(&claim_id)
            .ok_or_else(|| GatewayError::NotFound(format!("claim {claim_id}")))?;
        if case.status != ClaimStatus::PreauthApproved {
            return Err(GatewayError::invalid_state("claim", case.status, "submit"));
        }
        self.ensure_registered(&supporting_bundle_ids)?;
        let guard = self
            .consents
            .begin_fetch(case.consent_id, case.release.clone())?;

        let all_bundles: Vec<BundleId> = case
            .bundle_ids
            .iter()
            .chain(supporting_bundle_ids.iter())
            .copied()
            .collect();
        let message = json!({
            "claim": {
                "id": claim_id,
                "use": "claim",
                "transaction_id": case.transaction_id,
                "consent_id": case.consent_id,
                "total": case.amount,
                "bundles": self.bundle_refs(&all_bundles),
            }
        });
        let message_id = self.send(case.transaction_id, Action::ClaimSubmit, message, guard)?;

        let now = self.clock().now();
        case.supporting_bundle_ids = supporting_bundle_ids;
        case.pending_message_id = Some(message_id);
        case.advance(ClaimStatus::ClaimSubmitted, now);
        self.by_message.insert(message_id, claim_id);
        self.persist(&case);
        audit_claim(&case);
        Ok(case.clone())
    }

    /// Records an adjudication result for `claim_id`.
    ///
    /// An approved claim keeps waiting on its submission message for the payment notice.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidState`] if the outcome does not follow from the current
    /// status.
    pub fn record_adjudication(
        &self,
        claim_id: ClaimId,
        outcome: AdjudicationOutcome,
    ) -> GatewayResult<ClaimCase> {
        let mut case = self
            .cases
            .get_mut(&claim_id)
            .ok_or_else(|| GatewayError::NotFound(format!("claim {claim_id}")))?;

        let Some(to) = case.status.after_outcome(&outcome) else {
            return Err(GatewayError::invalid_state(
                "claim",
                case.status,
                format!("record {outcome:?} for"),
            ));
        };

        if let Some(message_id) = case.pending_message_id {
            self.correlator().close_message(message_id);
            if to.awaited_callback().is_none() {
                case.pending_message_id = None;
                self.by_message.remove(&message_id);
            }
        }
        if let AdjudicationOutcome::Denied { reason } = outcome {
            case.denial_reason = Some(reason);
        }
        case.advance(to, self.clock().now());
        self.persist(&case);
        audit_claim(&case);
        Ok(case.clone())
    }

    /// Verifies and applies an `on_preauth_submit` / `on_claim_submit` callback.
    ///
    /// A callback the correlator no longer matches (late, timed out or following an
    /// approval) is still applied when its case is waiting on that message and the outcome
    /// follows from the case's status; otherwise it is dropped.
    pub fn handle_callback(&self, signed: &SignedEnvelope) -> GatewayResult<ClaimCallbackOutcome> {
        let ctx = &signed.envelope().context;
        if !matches!(ctx.action, Action::OnPreauthSubmit | Action::OnClaimSubmit) {
            return Err(GatewayError::InvalidInput(format!(
                "{} is not a claims callback",
                ctx.action
            )));
        }
        let verified = self.verifier.verify(signed, self.clock().now())?;

        let (claim_id, unmatched) = match self.correlator().resolve(ctx.message_id, ctx) {
            Resolution::Matched(ticket) => match self.claim_for(ticket.message_id) {
                Some(claim_id) => (claim_id, None),
                None => {
                    self.correlator()
                        .note_unmatched(ctx.message_id, UnmatchedReason::UnknownMessage);
                    return Ok(ClaimCallbackOutcome::Dropped(UnmatchedReason::UnknownMessage));
                }
            },
            Resolution::Unmatched(reason) => match self.awaiting(ctx) {
                Some(claim_id) => (claim_id, Some(reason)),
                None => return Ok(ClaimCallbackOutcome::Dropped(reason)),
            },
        };
        if let Some(echoed) = verified.message().pointer("/claim/id").and_then(Value::as_str) {
            if echoed != claim_id.to_string() {
                return Err(GatewayError::MalformedEnvelope(format!(
                    "callback names claim {echoed} but answers claim {claim_id}"
                )));
            }
        }

        let outcome = AdjudicationOutcome::from_message(verified.message())?;
        if let Some(reason) = unmatched {
            let follows = self
                .cases
                .get(&claim_id)
                .and_then(|case| case.status.after_outcome(&outcome))
                .is_some();
            if !follows {
                return Ok(ClaimCallbackOutcome::Dropped(reason));
            }
            info!(
                claim_id = %claim_id,
                message_id = %ctx.message_id,
                correlator = %reason,
                "applying exchange answer outside its ticket"
            );
        }
        self.record_adjudication(claim_id, outcome)
            .map(ClaimCallbackOutcome::Applied)
    }

    /// Notes claims requests the exchange never answered. The case keeps its status and
    /// keeps waiting, so a late adjudication is still applied.
    pub fn on_tickets_expired(&self, tickets: &[Ticket]) {
        for ticket in tickets {
            let Some(claim_id) = self.claim_for(ticket.message_id) else {
                continue;
            };
            if let Some(mut case) = self.cases.get_mut(&claim_id) {
                case.notes.push(format!(
                    "no {} answer before {}",
                    ticket.action, ticket.deadline
                ));
                self.persist(&case);
                warn!(
                    claim_id = %claim_id,
                    action = %ticket.action,
                    "claims exchange did not answer in time"
                );
            }
        }
    }

    /// Drops settled cases unchanged for longer than the retention window from memory.
    /// With a store they stay readable through [`ClaimsAdapter::get`].
    pub fn evict_settled(&self, now: DateTime<Utc>) -> Vec<ClaimId> {
        let due: Vec<ClaimId> = self
            .cases
            .iter()
            .filter(|case| self.is_evictable(case, now))
            .map(|case| case.id)
            .collect();
        for claim_id in &due {
            self.cases.remove(claim_id);
            debug!(claim_id = %claim_id, "settled claim evicted from memory");
        }
        due
    }

    pub fn get(&self, claim_id: ClaimId) -> Option<ClaimCase> {
        if let Some(case) = self.cases.get(&claim_id) {
            return Some(case.clone());
        }
        let store = self.store.as_ref()?;
        match store.load(&claim_id.shardable()) {
            Ok(case) => case,
            Err(e) => {
                warn!(claim_id = %claim_id, error = %e, "failed to read claim case");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    fn claim_for(&self, message_id: MessageId) -> Option<ClaimId> {
        self.by_message.get(&message_id).map(|entry| *entry.value())
    }

    /// The case still waiting on the message `ctx` answers, if the callback fits it.
    fn awaiting(&self, ctx: &Context) -> Option<ClaimId> {
        let claim_id = self.claim_for(ctx.message_id)?;
        let case = self.cases.get(&claim_id)?;
        let fits = case.pending_message_id == Some(ctx.message_id)
            && case.transaction_id == ctx.transaction_id
            && case.status.awaited_callback() == Some(ctx.action);
        fits.then_some(claim_id)
    }

    fn is_evictable(&self, case: &ClaimCase, now: DateTime<Utc>) -> bool {
        case.status.is_terminal() && after(case.updated_at, self.config().settled_retention()) <= now
    }

    /// Writes `case` through to disk. A failed write is logged; the request has already
    /// gone out, so the in-memory case stays authoritative.
    fn persist(&self, case: &ClaimCase) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&case.id.shardable(), case) {
            warn!(claim_id = %case.id, error = %e, "failed to persist claim case");
        }
    }

    fn ensure_registered(&self, bundle_ids: &[BundleId]) -> GatewayResult<()> {
        let missing = self.bundles.missing(bundle_ids);
        if missing.is_empty() {
            return Ok(());
        }
        let listed: Vec<String> = missing.iter().map(ToString::to_string).collect();
        Err(GatewayError::PreconditionFailed(format!(
            "bundles not validated: {}",
            listed.join(", ")
        )))
    }

    fn bundle_refs(&self, bundle_ids: &[BundleId]) -> Vec<Value> {
        bundle_ids
            .iter()
            .filter_map(|id| self.bundles.get(*id))
            .map(|b| json!({"id": b.canonical.bundle_id, "sha256": b.canonical.sha256}))
            .collect()
    }

    /// Signs `message`, registers the callback ticket and starts delivery to the exchange.
    /// Delivery is abandoned if the consent behind `guard` is revoked first.
    fn send(
        &self,
        transaction_id: TransactionId,
        action: Action,
        message: Value,
        mut guard: FetchGuard,
    ) -> GatewayResult<MessageId> {
        let config = self.config();
        let exchange = config
            .claims_exchange_uri()
            .ok_or_else(|| {
                GatewayError::PreconditionFailed("no claims exchange URI configured".into())
            })?
            .to_owned();

        let now = self.clock().now();
        let message_id = MessageId::new();
        let ttl = config.default_ttl();
        let envelope = Envelope {
            context: Context {
                domain: config.domain().to_owned(),
                action,
                transaction_id,
                message_id,
                bap_id: config.subscriber_id().to_owned(),
                bap_uri: config.subscriber_uri().to_owned(),
                bpp_id: None,
                bpp_uri: None,
                timestamp: now,
                ttl: i64::try_from(ttl.as_secs())
                    .unwrap_or(MAX_TTL_SECS)
                    .clamp(1, MAX_TTL_SECS),
                signature: None,
            },
            message,
        };
        let signed = self.signer.sign(envelope)?;
        let deadline = after(now, ttl);
        self.correlator()
            .register(transaction_id, action, message_id, deadline, None)?;

        let transport = Arc::clone(&self.transport);
        let clock = Arc::clone(self.clock());
        let retry = config.retry();
        tokio::spawn(async move {
            let consent_id = guard.consent_id();
            if let Err(e) = guard.ensure_active() {
                warn!(transaction_id = %transaction_id, error = %e, "claims request withheld");
                return;
            }
            let delivery = deliver(
                transport.as_ref(),
                &exchange,
                &signed,
                retry,
                deadline,
                clock.as_ref(),
            );
            let outcome = tokio::select! {
                outcome = delivery => outcome,
                () = guard.revoked() => {
                    warn!(
                        transaction_id = %transaction_id,
                        consent_id = %consent_id,
                        "consent revoked; claims delivery abandoned"
                    );
                    return;
                }
            };
            if !outcome.is_delivered() {
                warn!(
                    transaction_id = %transaction_id,
                    action = %action,
                    outcome = ?outcome,
                    "claims request not delivered"
                );
            }
        });
        Ok(message_id)
    }
}

/// The release a claim on `transaction` makes: the provider's records for the confirmed
/// care context, handed over by this gateway.
fn release_for(transaction: &Transaction, hi_type: HiType) -> GatewayResult<ReleaseRequest> {
    let provider = transaction.bpp.as_ref().ok_or_else(|| {
        GatewayError::PreconditionFailed(format!(
            "transaction {} has no provider",
            transaction.id
        ))
    })?;
    Ok(ReleaseRequest {
        hiu_id: transaction.bap.id.clone(),
        hip_id: provider.id.clone(),
        hi_type,
        record_date: None,
        care_context: transaction.care_context_id.clone(),
    })
}

fn audit_claim(case: &ClaimCase) {
    if let Some(change) = case.history.last() {
        info!(
            target: AUDIT_TARGET,
            claim_id = %case.id,
            transaction_id = %case.transaction_id,
            from = %change.from,
            to = %change.to,
            "claim transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::tests::patient_bundle;
    use crate::consent::DenyReason;
    use crate::testing::{harness, harness_with, Harness};
    use serde_json::json;

    fn amount() -> Amount {
        Amount::new(1_250_00, "INR").unwrap()
    }

    fn bundle(h: &Harness) -> BundleId {
        h.gateway
            .bundles()
            .validate_and_register(&patient_bundle("91-1111-2222-3333"))
            .unwrap()
            .bundle_id
    }

    async fn preauth(h: &Harness) -> (TransactionId, ClaimCase) {
        let id = h.confirmed().await;
        let case = h
            .claims
            .request_preauth(id, h.claim_consent(), vec![bundle(h)], amount())
            .await
            .unwrap();
        (id, case)
    }

    /// Drives a case to `claim_submitted` through the exchange's pre-authorisation answer.
    async fn submitted(h: &Harness) -> ClaimCase {
        let (_, case) = preauth(h).await;
        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        let approval =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "approved"}}));
        h.claims.handle_callback(&approval).unwrap();
        h.claims.submit_claim(case.id, vec![]).unwrap()
    }

    #[tokio::test]
    async fn preauth_requires_confirmed_transaction() {
        let h = harness();
        let id = h.selected().await;

        let err = h
            .claims
            .request_preauth(id, h.claim_consent(), vec![bundle(&h)], amount())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PreconditionFailed(_)));
        assert!(h.claims.is_empty());
    }

    #[tokio::test]
    async fn preauth_requires_validated_bundles() {
        let h = harness();
        let id = h.confirmed().await;
        let consent = h.claim_consent();
        let unknown = BundleId::from_digest(&[9u8; 32]);

        let err = h
            .claims
            .request_preauth(id, consent, vec![unknown], amount())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PreconditionFailed(_)));
        let err = h
            .claims
            .request_preauth(id, consent, vec![], amount())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PreconditionFailed(_)));
        assert!(h.claims.is_empty());
    }

    #[tokio::test]
    async fn preauth_needs_a_live_consent_for_the_release() {
        let h = harness();
        let id = h.confirmed().await;
        let bundle_id = bundle(&h);

        let revoked = h.claim_consent();
        h.gateway.consents().revoke(revoked.consent_id).unwrap();
        let err = h
            .claims
            .request_preauth(id, revoked, vec![bundle_id], amount())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConsentDenied(DenyReason::Revoked)));

        let mut wrong_type = h.claim_consent();
        wrong_type.hi_type = HiType::WellnessRecord;
        let err = h
            .claims
            .request_preauth(id, wrong_type, vec![bundle_id], amount())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConsentDenied(DenyReason::OutOfScope)));

        assert!(h.claims.is_empty());
        let sent = h.transport.sent().await;
        assert!(sent.iter().all(|s| !s.envelope.envelope().context.action.is_claims()));
    }

    #[tokio::test]
    async fn revoking_the_consent_blocks_claim_submission() {
        let h = harness();
        let (_, case) = preauth(&h).await;
        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        let approval =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "approved"}}));
        h.claims.handle_callback(&approval).unwrap();

        h.gateway.consents().revoke(case.consent_id).unwrap();
        let err = h.claims.submit_claim(case.id, vec![]).unwrap_err();
        assert!(matches!(err, GatewayError::ConsentDenied(DenyReason::Revoked)));
        assert_eq!(h.claims.get(case.id).unwrap().status, ClaimStatus::PreauthApproved);
    }

    #[tokio::test]
    async fn preauth_is_sent_to_the_exchange() {
        let h = harness();
        let (id, case) = preauth(&h).await;
        assert_eq!(case.status, ClaimStatus::PreauthRequested);
        assert_eq!(case.transaction_id, id);
        assert_eq!(case.release.hip_id, "bpp2.example.org");
        assert_eq!(case.release.care_context.as_deref(), Some("cc-1"));

        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        assert_eq!(request.envelope().context.action, Action::PreauthSubmit);
        assert_eq!(request.envelope().context.bpp_id, None);
        assert_eq!(
            request.envelope().message["claim"]["id"],
            json!(case.id.to_string())
        );
        assert_eq!(
            request.envelope().message["claim"]["consent_id"],
            json!(case.consent_id.to_string())
        );
        let sent = h.transport.sent().await;
        assert_eq!(sent.last().unwrap().uri, "https://nhcx.example.org/claims");
    }

    #[tokio::test]
    async fn claim_lifecycle_through_callbacks() {
        let h = harness();
        let (_, case) = preauth(&h).await;

        let err = h.claims.submit_claim(case.id, vec![]).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState { .. }));

        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        let approval = h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "approved"}}));
        let applied = h.claims.handle_callback(&approval).unwrap();
        let ClaimCallbackOutcome::Applied(approved) = applied else {
            panic!("expected the approval to apply");
        };
        assert_eq!(approved.status, ClaimStatus::PreauthApproved);
        assert_eq!(approved.pending_message_id, None);
        assert_eq!(
            h.claims.handle_callback(&approval).unwrap(),
            ClaimCallbackOutcome::Dropped(UnmatchedReason::Duplicate)
        );

        let submitted = h.claims.submit_claim(case.id, vec![]).unwrap();
        assert_eq!(submitted.status, ClaimStatus::ClaimSubmitted);
        let paid = h.claims.record_adjudication(case.id, AdjudicationOutcome::Approved).unwrap();
        assert_eq!(paid.status, ClaimStatus::ClaimApproved);
        let paid = h.claims.record_adjudication(case.id, AdjudicationOutcome::Paid).unwrap();
        assert_eq!(paid.status, ClaimStatus::Paid);
        assert_eq!(paid.history.len(), 4);
    }

    #[tokio::test]
    async fn payment_notice_follows_claim_approval() {
        let h = harness();
        let case = submitted(&h).await;
        let request = h.claims_request(case.pending_message_id.unwrap()).await;

        let approval =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "approved"}}));
        let ClaimCallbackOutcome::Applied(approved) = h.claims.handle_callback(&approval).unwrap()
        else {
            panic!("expected the claim approval to apply");
        };
        assert_eq!(approved.status, ClaimStatus::ClaimApproved);
        assert_eq!(approved.pending_message_id, case.pending_message_id);
        assert_eq!(
            h.claims.handle_callback(&approval).unwrap(),
            ClaimCallbackOutcome::Dropped(UnmatchedReason::Duplicate)
        );

        let payment =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "paid"}}));
        let ClaimCallbackOutcome::Applied(paid) = h.claims.handle_callback(&payment).unwrap()
        else {
            panic!("expected the payment notice to apply");
        };
        assert_eq!(paid.status, ClaimStatus::Paid);
        assert_eq!(paid.pending_message_id, None);
        assert!(matches!(
            h.claims.handle_callback(&payment).unwrap(),
            ClaimCallbackOutcome::Dropped(_)
        ));
    }

    #[tokio::test]
    async fn denial_is_final() {
        let h = harness();
        let (_, case) = preauth(&h).await;
        let denied = h
            .claims
            .record_adjudication(
                case.id,
                AdjudicationOutcome::Denied {
                    reason: "policy lapsed".into(),
                },
            )
            .unwrap();
        assert_eq!(denied.status, ClaimStatus::PreauthDenied);
        assert_eq!(denied.denial_reason.as_deref(), Some("policy lapsed"));

        for outcome in [AdjudicationOutcome::Approved, AdjudicationOutcome::Paid] {
            assert!(h.claims.record_adjudication(case.id, outcome).is_err());
        }
        assert!(h.claims.submit_claim(case.id, vec![]).is_err());
    }

    #[tokio::test]
    async fn unanswered_request_is_noted_on_sweep() {
        let h = harness();
        let (_, case) = preauth(&h).await;
        let later = h.clock.now() + chrono::Duration::seconds(31);
        let report = h.gateway.sweep(later).await;
        assert_eq!(report.transactions.other_tickets.len(), 1);

        let noted = h.claims.get(case.id).unwrap();
        assert_eq!(noted.status, ClaimStatus::PreauthRequested);
        assert_eq!(noted.pending_message_id, case.pending_message_id);
        assert_eq!(noted.notes.len(), 1);
    }

    #[tokio::test]
    async fn late_adjudication_after_timeout_is_applied() {
        let h = harness();
        let (_, case) = preauth(&h).await;
        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        h.clock.advance(chrono::Duration::seconds(31));
        h.gateway.sweep(h.clock.now()).await;

        let approval =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "approved"}}));
        let ClaimCallbackOutcome::Applied(approved) = h.claims.handle_callback(&approval).unwrap()
        else {
            panic!("expected the late approval to apply");
        };
        assert_eq!(approved.status, ClaimStatus::PreauthApproved);
        assert_eq!(
            h.claims.handle_callback(&approval).unwrap(),
            ClaimCallbackOutcome::Dropped(UnmatchedReason::Late)
        );
    }

    #[tokio::test]
    async fn answers_for_another_case_state_are_dropped_after_timeout() {
        let h = harness();
        let (_, case) = preauth(&h).await;
        let request = h.claims_request(case.pending_message_id.unwrap()).await;
        h.clock.advance(chrono::Duration::seconds(31));
        h.gateway.sweep(h.clock.now()).await;

        let payment =
            h.exchange_answer(&request, json!({"claim": {"id": case.id, "outcome": "paid"}}));
        assert!(matches!(
            h.claims.handle_callback(&payment).unwrap(),
            ClaimCallbackOutcome::Dropped(_)
        ));
        assert_eq!(h.claims.get(case.id).unwrap().status, ClaimStatus::PreauthRequested);
    }

    #[tokio::test]
    async fn cases_survive_restart_and_settle_out_of_memory() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_path_buf();
        let (case, request) = {
            let h = harness_with(|c| c.with_data_dir(data.clone()));
            let (_, case) = preauth(&h).await;
            let request = h.claims_request(case.pending_message_id.unwrap()).await;
            (case, request)
        };

        let h = harness_with(|c| {
            c.with_data_dir(data.clone())
                .with_settled_retention(std::time::Duration::from_secs(60))
        });
        assert_eq!(h.claims.len(), 1);
        let denial = h.exchange_answer(
            &request,
            json!({"claim": {"id": case.id, "outcome": "denied", "reason": "not covered"}}),
        );
        let ClaimCallbackOutcome::Applied(denied) = h.claims.handle_callback(&denial).unwrap()
        else {
            panic!("expected the reloaded case to take the answer");
        };
        assert_eq!(denied.status, ClaimStatus::PreauthDenied);

        assert!(h.claims.evict_settled(h.clock.now()).is_empty());
        let later = h.clock.now() + chrono::Duration::seconds(60);
        assert_eq!(h.claims.evict_settled(later), vec![case.id]);
        assert!(h.claims.is_empty());
        assert_eq!(h.claims.get(case.id).unwrap().status, ClaimStatus::PreauthDenied);
    }
}
