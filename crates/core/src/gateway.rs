//! The assembled gateway.
//!
//! [`Gateway`] wires the codec, correlator, transaction machine, consent ledger, bundle
//! registry and claims adapter together and is what the binaries hold. Inbound callbacks
//! are routed here by action: claims callbacks go to the claims adapter and every other
//! callback to the transaction machine.

use crate::bundles::BundleRegistry;
use crate::claims::{ClaimCallbackOutcome, ClaimsAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::consent::ConsentLedger;
use crate::correlator::Correlator;
use crate::transaction::{CallbackOutcome, HttpTransport, SweepReport, TransactionMachine, Transport};
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use fhir::{BundleValidator, CanonicalBundle, ExternalReferenceRegistry, TerminologyRegistry};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uhi_codec::{SignedEnvelope, Signer, SigningKeyPair, TrustedKeyRegistry, Verifier};
use uhi_uuid::{ClaimId, ConsentId};

/// Files re-read by [`Gateway::reload`]. Unset entries are skipped.
#[derive(Clone, Debug, Default)]
pub struct ReloadSources {
    pub trusted_keys: Option<PathBuf>,
    pub terminology: Option<PathBuf>,
    pub external_references: Option<PathBuf>,
}

/// Entry counts after a reload, per registry that was re-read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub trusted_keys: Option<usize>,
    pub terminology_systems: Option<usize>,
    pub external_references: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    Transaction(CallbackOutcome),
    Claim(ClaimCallbackOutcome),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewaySweep {
    pub transactions: SweepReport,
    pub consents_expired: Vec<ConsentId>,
    pub claims_evicted: Vec<ClaimId>,
}

impl GatewaySweep {
    fn is_empty(&self) -> bool {
        self.transactions == SweepReport::default()
            && self.consents_expired.is_empty()
            && self.claims_evicted.is_empty()
    }
}

pub struct GatewayBuilder {
    config: Arc<CoreConfig>,
    signing_key: Arc<SigningKeyPair>,
    clock: Arc<dyn Clock>,
    transport: Option<Arc<dyn Transport>>,
    trusted_keys: Arc<TrustedKeyRegistry>,
    terminology: Arc<TerminologyRegistry>,
    external_references: Arc<ExternalReferenceRegistry>,
    reload_sources: ReloadSources,
}

impl GatewayBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_trusted_keys(mut self, keys: Arc<TrustedKeyRegistry>) -> Self {
        self.trusted_keys = keys;
        self
    }

    pub fn with_terminology(mut self, terminology: Arc<TerminologyRegistry>) -> Self {
        self.terminology = terminology;
        self
    }

    pub fn with_external_references(mut self, external: Arc<ExternalReferenceRegistry>) -> Self {
        self.external_references = external;
        self
    }

    pub fn with_reload_sources(mut self, sources: ReloadSources) -> Self {
        self.reload_sources = sources;
        self
    }

    /// Builds the gateway. With a data directory configured, consents and correlator
    /// tickets are reloaded from disk.
    ///
    /// # Errors
    ///
    /// Storage errors from reopening persisted state, or a transport that cannot be built.
    pub fn build(self) -> GatewayResult<Gateway> {
        let config = self.config;
        let clock = self.clock;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.default_ttl())?),
        };
        let correlator = Arc::new(match config.tickets_dir() {
            Some(dir) => Correlator::open(Arc::clone(&clock), dir)?,
            None => Correlator::new(Arc::clone(&clock)),
        });
        let consents = Arc::new(match config.consents_dir() {
            Some(dir) => ConsentLedger::open(Arc::clone(&clock), dir)?,
            None => ConsentLedger::new(Arc::clone(&clock)),
        });

        let signer = Signer::new(self.signing_key);
        let verifier = Verifier::new(Arc::clone(&self.trusted_keys));
        let machine = Arc::new(match config.transactions_dir() {
            Some(dir) => TransactionMachine::open(
                Arc::clone(&config),
                Arc::clone(&clock),
                signer.clone(),
                verifier.clone(),
                Arc::clone(&transport),
                Arc::clone(&correlator),
                dir,
            )?,
            None => TransactionMachine::new(
                Arc::clone(&config),
                Arc::clone(&clock),
                signer.clone(),
                verifier.clone(),
                Arc::clone(&transport),
                Arc::clone(&correlator),
            ),
        });
        let validator = Arc::new(BundleValidator::new(
            Arc::clone(&self.terminology),
            Arc::clone(&self.external_references),
        ));
        let bundles = Arc::new(BundleRegistry::new(validator, Arc::clone(&clock)));
        let claims = Arc::new(match config.claims_dir() {
            Some(dir) => ClaimsAdapter::open(
                Arc::clone(&machine),
                Arc::clone(&bundles),
                Arc::clone(&consents),
                signer.clone(),
                verifier.clone(),
                transport,
                dir,
            )?,
            None => ClaimsAdapter::new(
                Arc::clone(&machine),
                Arc::clone(&bundles),
                Arc::clone(&consents),
                signer.clone(),
                verifier.clone(),
                transport,
            ),
        });

        info!(
            subscriber_id = config.subscriber_id(),
            consents = consents.len(),
            tickets = correlator.len(),
            transactions = machine.len(),
            claims = claims.len(),
            trusted_keys = self.trusted_keys.len(),
            "gateway assembled"
        );

        Ok(Gateway {
            config,
            clock,
            signer,
            verifier,
            trusted_keys: self.trusted_keys,
            terminology: self.terminology,
            external_references: self.external_references,
            reload_sources: self.reload_sources,
            correlator,
            consents,
            machine,
            bundles,
            claims,
        })
    }
}

#[derive(Debug)]
pub struct Gateway {
    config: Arc<CoreConfig>,
    clock: Arc<dyn Clock>,
    signer: Signer,
    verifier: Verifier,
    trusted_keys: Arc<TrustedKeyRegistry>,
    terminology: Arc<TerminologyRegistry>,
    external_references: Arc<ExternalReferenceRegistry>,
    reload_sources: ReloadSources,
    correlator: Arc<Correlator>,
    consents: Arc<ConsentLedger>,
    machine: Arc<TransactionMachine>,
    bundles: Arc<BundleRegistry>,
    claims: Arc<ClaimsAdapter>,
}

impl Gateway {
    /// Starts a builder with the system clock, an HTTP transport and empty key and
    /// reference registries.
    pub fn builder(config: Arc<CoreConfig>, signing_key: Arc<SigningKeyPair>) -> GatewayBuilder {
        GatewayBuilder {
            config,
            signing_key,
            clock: Arc::new(SystemClock),
            transport: None,
            trusted_keys: Arc::new(TrustedKeyRegistry::new()),
            terminology: Arc::new(TerminologyRegistry::with_builtin()),
            external_references: Arc::new(ExternalReferenceRegistry::new()),
            reload_sources: ReloadSources::default(),
        }
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn trusted_keys(&self) -> &Arc<TrustedKeyRegistry> {
        &self.trusted_keys
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn consents(&self) -> &Arc<ConsentLedger> {
        &self.consents
    }

    pub fn machine(&self) -> &Arc<TransactionMachine> {
        &self.machine
    }

    pub fn bundles(&self) -> &Arc<BundleRegistry> {
        &self.bundles
    }

    pub fn claims(&self) -> &Arc<ClaimsAdapter> {
        &self.claims
    }

    /// Routes a signed inbound callback by its action.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidInput`] for request actions; this side only receives
    /// callbacks. Verification and matching errors pass through from the handler.
    pub async fn handle_inbound(&self, signed: &SignedEnvelope) -> GatewayResult<InboundOutcome> {
        let action = signed.envelope().context.action;
        if !action.is_callback() {
            return Err(GatewayError::InvalidInput(format!(
                "{action} is a request; only callbacks are accepted here"
            )));
        }
        if action.is_claims() {
            self.claims.handle_callback(signed).map(InboundOutcome::Claim)
        } else {
            self.machine
                .handle_callback(signed)
                .await
                .map(InboundOutcome::Transaction)
        }
    }

    /// Validates and normalises a clinical bundle, recording it for use by claims.
    pub fn validate_bundle(&self, bundle: &Value) -> GatewayResult<CanonicalBundle> {
        self.bundles.validate_and_register(bundle)
    }

    /// Applies every deadline due at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> GatewaySweep {
        let transactions = self.machine.sweep(now).await;
        self.claims.on_tickets_expired(&transactions.other_tickets);
        let consents_expired = self.consents.expire_due(now);
        let claims_evicted = self.claims.evict_settled(now);
        GatewaySweep {
            transactions,
            consents_expired,
            claims_evicted,
        }
    }

    /// Runs [`Gateway::sweep`] every `sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.config.sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let report = gateway.sweep(gateway.clock.now()).await;
                if !report.is_empty() {
                    debug!(
                        timed_out = report.transactions.timed_out.len(),
                        expired = report.transactions.expired.len(),
                        windows_closed = report.transactions.windows_closed.len(),
                        evicted = report.transactions.evicted.len(),
                        consents_expired = report.consents_expired.len(),
                        claims_evicted = report.claims_evicted.len(),
                        "sweep applied deadlines"
                    );
                }
            }
        })
    }

    /// Re-reads the trusted keys, terminology sets and external references from their
    /// configured files. A registry whose file fails to load keeps its previous contents.
    ///
    /// # Errors
    ///
    /// The first load failure, after attempting every configured file.
    pub fn reload(&self) -> GatewayResult<ReloadReport> {
        let sources = &self.reload_sources;
        let mut report = ReloadReport::default();
        let mut first_error = None;

        if let Some(path) = &sources.trusted_keys {
            match self.trusted_keys.load_file(path) {
                Ok(n) => report.trusted_keys = Some(n),
                Err(e) => {
                    first_error.get_or_insert(format!("{}: {e}", path.display()));
                }
            }
        }
        if let Some(path) = &sources.terminology {
            match self.terminology.load_file(path) {
                Ok(n) => report.terminology_systems = Some(n),
                Err(e) => {
                    first_error.get_or_insert(format!("{}: {e}", path.display()));
                }
            }
        }
        if let Some(path) = &sources.external_references {
            match self.external_references.load_file(path) {
                Ok(n) => report.external_references = Some(n),
                Err(e) => {
                    first_error.get_or_insert(format!("{}: {e}", path.display()));
                }
            }
        }

        info!(
            trusted_keys = ?report.trusted_keys,
            terminology_systems = ?report.terminology_systems,
            external_references = ?report.external_references,
            "registries reloaded"
        );
        match first_error {
            Some(message) => Err(GatewayError::InvalidInput(message)),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::harness;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn inbound_requests_are_refused() {
        let h = harness();
        let (participant, _) = h.providers[0].clone();
        let issued = h
            .machine
            .begin_select(participant, json!({"order": {}}))
            .await
            .unwrap();

        let err = h.gateway.handle_inbound(&issued.envelope).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn inbound_callbacks_reach_the_machine() {
        let h = harness();
        let (participant, _) = h.providers[0].clone();
        let issued = h
            .machine
            .begin_select(participant, json!({"order": {}}))
            .await
            .unwrap();
        let cb = h.callback(0, &issued, json!({"order": {"quote": {}}}));

        let outcome = h.gateway.handle_inbound(&cb).await.unwrap();
        assert!(matches!(
            outcome,
            InboundOutcome::Transaction(CallbackOutcome::Applied { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_expires_consents() {
        use crate::consent::{ConsentScope, DateRange, HiType, Purpose};
        use uhi_types::NonEmptyText;

        let h = harness();
        let now = h.clock.now();
        let scope = ConsentScope {
            hi_types: vec![HiType::Prescription],
            date_range: DateRange {
                from: now - chrono::Duration::days(30),
                to: now,
            },
            data_erase_at: now + chrono::Duration::hours(1),
        };
        let consent = h
            .gateway
            .consents()
            .request_consent(
                NonEmptyText::new("91-1111-2222-3333").unwrap(),
                Purpose::Caremgt,
                scope,
                NonEmptyText::new("hiu.example.org").unwrap(),
                NonEmptyText::new("hip.example.org").unwrap(),
            )
            .unwrap();

        let report = h.gateway.sweep(now + chrono::Duration::hours(2)).await;
        assert_eq!(report.consents_expired, vec![consent.id]);
    }

    #[tokio::test]
    async fn reload_reports_failures_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let references = dir.path().join("references.yaml");
        let mut file = std::fs::File::create(&references).unwrap();
        writeln!(file, "references:\n  - Organization/hip-1\n  - Practitioner/dr-1").unwrap();

        let h = crate::testing::harness_with_sources(ReloadSources {
            trusted_keys: Some(dir.path().join("missing.yaml")),
            terminology: None,
            external_references: Some(references),
        });
        assert!(h.gateway.reload().is_err());
        assert!(h.gateway.bundles().validator().external_references().contains("Organization/hip-1"));
    }
}
