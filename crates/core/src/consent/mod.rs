//! Consent ledger.
//!
//! The ledger is the only writer of consent status. Every data-release path asks
//! [`ConsentLedger::check`] (or [`ConsentLedger::check_release`]) at the moment of release;
//! results are never cached, so a revoke is visible to the very next check.
//!
//! Lifecycle: `requested -> granted | denied`, `requested | granted -> revoked`,
//! `granted -> expired` once the access window closes. `denied`, `revoked` and `expired`
//! are terminal.

mod artifact;
mod fetch;

pub use artifact::{
    CareContext, ConsentArtifact, ConsentDecision, ConsentScope, ConsentStatus, DateRange,
    DenyReason, HiType, PatientAuthorization, Purpose, ReleaseRequest,
};
pub use fetch::FetchGuard;

use crate::clock::Clock;
use crate::store::YamlStore;
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use uhi_codec::canonical::to_canonical_bytes;
use uhi_codec::AUDIT_TARGET;
use uhi_types::NonEmptyText;
use uhi_uuid::ConsentId;

const REVOCATION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct ConsentLedger {
    artifacts: DashMap<ConsentId, ConsentArtifact>,
    store: Option<YamlStore<ConsentArtifact>>,
    clock: Arc<dyn Clock>,
    revocations: broadcast::Sender<ConsentId>,
}

impl ConsentLedger {
    /// In-memory ledger.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (revocations, _) = broadcast::channel(REVOCATION_CHANNEL_CAPACITY);
        Self {
            artifacts: DashMap::new(),
            store: None,
            clock,
            revocations,
        }
    }

    /// Ledger persisted under `dir`, reloading any artifacts already stored there.
    pub fn open(clock: Arc<dyn Clock>, dir: PathBuf) -> GatewayResult<Self> {
        let store: YamlStore<ConsentArtifact> = YamlStore::open(dir)?;
        let mut ledger = Self::new(clock);
        for artifact in store.load_all() {
            ledger.artifacts.insert(artifact.id, artifact);
        }
        tracing::info!(
            count = ledger.artifacts.len(),
            dir = %store.root().display(),
            "consent ledger loaded"
        );
        ledger.store = Some(store);
        Ok(ledger)
    }

    /// Records a new consent request in status `requested`.
    pub fn request_consent(
        &self,
        patient_id: NonEmptyText,
        purpose: Purpose,
        scope: ConsentScope,
        hiu_id: NonEmptyText,
        hip_id: NonEmptyText,
    ) -> GatewayResult<ConsentArtifact> {
        let now = self.clock.now();
        if scope.hi_types.is_empty() {
            return Err(GatewayError::InvalidInput(
                "consent scope must name at least one HI type".into(),
            ));
        }
        if scope.date_range.from > scope.date_range.to {
            return Err(GatewayError::InvalidInput(
                "consent date range starts after it ends".into(),
            ));
        }
        if scope.data_erase_at <= now {
            return Err(GatewayError::InvalidInput(
                "consent data_erase_at must be in the future".into(),
            ));
        }

        let artifact = ConsentArtifact {
            id: ConsentId::new(),
            patient_id,
            purpose,
            scope,
            hiu_id,
            hip_id,
            status: ConsentStatus::Requested,
            requested_at: now,
            updated_at: now,
            granted_at: None,
            terms_hash: None,
            authorization_digest: None,
            care_contexts: Vec::new(),
        };
        self.persist(&artifact)?;
        self.artifacts.insert(artifact.id, artifact.clone());
        tracing::info!(
            target: AUDIT_TARGET,
            consent_id = %artifact.id,
            hiu_id = %artifact.hiu_id,
            hip_id = %artifact.hip_id,
            purpose = ?artifact.purpose,
            "consent requested"
        );
        Ok(artifact)
    }

    /// `requested -> granted`.
    pub fn grant(
        &self,
        consent_id: ConsentId,
        authorization: PatientAuthorization,
    ) -> GatewayResult<ConsentArtifact> {
        let now = self.clock.now();
        self.transition(consent_id, "grant", |artifact| {
            if artifact.status != ConsentStatus::Requested {
                return Err(GatewayError::invalid_state(
                    "consent",
                    artifact.status,
                    "grant",
                ));
            }
            if artifact.scope.data_erase_at <= now {
                return Err(GatewayError::Expired(format!(
                    "consent {} access window closed before grant",
                    artifact.id
                )));
            }
            artifact.status = ConsentStatus::Granted;
            artifact.granted_at = Some(now);
            artifact.terms_hash = Some(terms_hash(artifact)?);
            artifact.authorization_digest = Some(hex::encode(Sha256::digest(
                format!("{}:{}", authorization.method, authorization.proof).as_bytes(),
            )));
            Ok(true)
        })
    }

    /// `requested -> denied`.
    pub fn deny(&self, consent_id: ConsentId) -> GatewayResult<ConsentArtifact> {
        self.transition(consent_id, "deny", |artifact| {
            if artifact.status != ConsentStatus::Requested {
                return Err(GatewayError::invalid_state(
                    "consent",
                    artifact.status,
                    "deny",
                ));
            }
            artifact.status = ConsentStatus::Denied;
            Ok(true)
        })
    }

    /// Revokes a `requested` or `granted` consent. Revoking an already revoked consent is a
    /// no-op that returns the artifact unchanged and notifies nobody.
    pub fn revoke(&self, consent_id: ConsentId) -> GatewayResult<ConsentArtifact> {
        let mut changed = false;
        let artifact = self.transition(consent_id, "revoke", |artifact| match artifact.status {
            ConsentStatus::Revoked => Ok(false),
            ConsentStatus::Requested | ConsentStatus::Granted => {
                artifact.status = ConsentStatus::Revoked;
                changed = true;
                Ok(true)
            }
            other => Err(GatewayError::invalid_state("consent", other, "revoke")),
        })?;
        if changed {
            // No receivers is fine: nothing is fetching under this consent.
            let _ = self.revocations.send(consent_id);
        }
        Ok(artifact)
    }

    /// Whether data may be released under `consent_id` at `at`.
    pub fn check(&self, consent_id: ConsentId, at: DateTime<Utc>) -> ConsentDecision {
        match self.artifacts.get(&consent_id) {
            Some(artifact) => decide(&artifact, at),
            None => ConsentDecision::Denied(DenyReason::NotGranted),
        }
    }

    /// [`ConsentLedger::check`] plus the scope test for a concrete release.
    pub fn check_release(
        &self,
        consent_id: ConsentId,
        at: DateTime<Utc>,
        request: &ReleaseRequest,
    ) -> ConsentDecision {
        let Some(artifact) = self.artifacts.get(&consent_id) else {
            return ConsentDecision::Denied(DenyReason::NotGranted);
        };
        match decide(&artifact, at) {
            ConsentDecision::Allowed if !artifact.covers(request) => {
                ConsentDecision::Denied(DenyReason::OutOfScope)
            }
            decision => decision,
        }
    }

    /// Attaches a care context to a granted consent.
    pub fn link_care_context(
        &self,
        consent_id: ConsentId,
        care_context: CareContext,
    ) -> GatewayResult<ConsentArtifact> {
        self.transition(consent_id, "link care context to", |artifact| {
            if artifact.status != ConsentStatus::Granted {
                return Err(GatewayError::invalid_state(
                    "consent",
                    artifact.status,
                    "link care context to",
                ));
            }
            if artifact
                .care_contexts
                .iter()
                .any(|c| c.reference == care_context.reference)
            {
                return Ok(false);
            }
            artifact.care_contexts.push(care_context.clone());
            Ok(true)
        })
    }

    /// Moves granted or still-pending consents whose access window has closed to
    /// `expired`.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<ConsentId> {
        let due: Vec<ConsentId> = self
            .artifacts
            .iter()
            .filter(|a| is_due(a, now))
            .map(|a| a.id)
            .collect();

        let mut expired = Vec::new();
        for consent_id in due {
            let result = self.transition(consent_id, "expire", |artifact| {
                if is_due(artifact, now) {
                    artifact.status = ConsentStatus::Expired;
                    Ok(true)
                } else {
                    Ok(false)
                }
            });
            match result {
                Ok(artifact) if artifact.status == ConsentStatus::Expired => expired.push(consent_id),
                Ok(_) => {}
                Err(e) => tracing::warn!(consent_id = %consent_id, error = %e, "failed to expire consent"),
            }
        }
        expired
    }

    pub fn get(&self, consent_id: ConsentId) -> Option<ConsentArtifact> {
        self.artifacts.get(&consent_id).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Notifications of every revoke, in order.
    pub fn subscribe_revocations(&self) -> broadcast::Receiver<ConsentId> {
        self.revocations.subscribe()
    }

    /// Starts a data fetch under `consent_id`, failing unless the release is allowed now.
    pub fn begin_fetch(
        self: &Arc<Self>,
        consent_id: ConsentId,
        request: ReleaseRequest,
    ) -> GatewayResult<FetchGuard> {
        // Subscribe first so a revoke racing this call is still delivered to the guard.
        let revocations = self.subscribe_revocations();
        match self.check_release(consent_id, self.clock.now(), &request) {
            ConsentDecision::Allowed => Ok(FetchGuard::new(
                Arc::clone(self),
                consent_id,
                request,
                revocations,
            )),
            ConsentDecision::Denied(reason) => Err(GatewayError::ConsentDenied(reason)),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Applies `apply` to one artifact under its entry lock. `apply` returns whether the
    /// artifact changed; changed artifacts are persisted before the lock is released and
    /// rolled back if persisting fails.
    fn transition<F>(
        &self,
        consent_id: ConsentId,
        operation: &str,
        apply: F,
    ) -> GatewayResult<ConsentArtifact>
    where
        F: FnOnce(&mut ConsentArtifact) -> GatewayResult<bool>,
    {
        let mut entry = self
            .artifacts
            .get_mut(&consent_id)
            .ok_or_else(|| GatewayError::NotFound(format!("consent {consent_id}")))?;

        let before = entry.clone();
        if !apply(&mut *entry)? {
            return Ok(before);
        }
        entry.updated_at = self.clock.now();

        if let Err(e) = self.persist(&*entry) {
            *entry = before;
            return Err(e);
        }

        tracing::info!(
            target: AUDIT_TARGET,
            consent_id = %consent_id,
            operation,
            from = %before.status,
            to = %entry.status,
            "consent transition"
        );
        Ok(entry.clone())
    }

    fn persist(&self, artifact: &ConsentArtifact) -> GatewayResult<()> {
        match &self.store {
            Some(store) => store.save(&artifact.id.shardable(), artifact),
            None => Ok(()),
        }
    }
}

fn is_due(artifact: &ConsentArtifact, now: DateTime<Utc>) -> bool {
    matches!(
        artifact.status,
        ConsentStatus::Requested | ConsentStatus::Granted
    ) && artifact.scope.data_erase_at <= now
}

fn decide(artifact: &ConsentArtifact, at: DateTime<Utc>) -> ConsentDecision {
    match artifact.status {
        ConsentStatus::Revoked => ConsentDecision::Denied(DenyReason::Revoked),
        ConsentStatus::Expired => ConsentDecision::Denied(DenyReason::Expired),
        ConsentStatus::Requested | ConsentStatus::Denied => {
            ConsentDecision::Denied(DenyReason::NotGranted)
        }
        ConsentStatus::Granted if at >= artifact.scope.data_erase_at => {
            ConsentDecision::Denied(DenyReason::Expired)
        }
        ConsentStatus::Granted if artifact.granted_at.is_some_and(|g| at < g) => {
            ConsentDecision::Denied(DenyReason::NotGranted)
        }
        ConsentStatus::Granted => ConsentDecision::Allowed,
    }
}

fn terms_hash(artifact: &ConsentArtifact) -> GatewayResult<String> {
    let terms = json!({
        "consent_id": artifact.id,
        "patient_id": artifact.patient_id,
        "purpose": artifact.purpose,
        "scope": artifact.scope,
        "hiu_id": artifact.hiu_id,
        "hip_id": artifact.hip_id,
    });
    Ok(hex::encode(Sha256::digest(to_canonical_bytes(&terms))))
}
