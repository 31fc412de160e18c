//! Shared fixtures for unit tests: a gateway on a manual clock with a recording transport,
//! two providers and a claims exchange whose keys are trusted.

use crate::claims::{ClaimConsent, ClaimsAdapter};
use crate::clock::{Clock, ManualClock};
use crate::config::CoreConfig;
use crate::consent::{
    CareContext, ConsentScope, DateRange, HiType, PatientAuthorization, Purpose,
};
use crate::gateway::{Gateway, ReloadSources};
use crate::transaction::{
    Issued, Participant, RecordingTransport, TransactionMachine, TransactionState,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use uhi_codec::{Context, Envelope, KeyId, SignedEnvelope, SigningKeyPair, TrustedKeyRegistry};
use uhi_types::NonEmptyText;
use uhi_uuid::{MessageId, TransactionId};

pub(crate) fn start() -> DateTime<Utc> {
    "2026-02-01T10:00:00Z".parse().unwrap()
}

pub(crate) struct Harness {
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) transport: Arc<RecordingTransport>,
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) machine: Arc<TransactionMachine>,
    pub(crate) claims: Arc<ClaimsAdapter>,
    pub(crate) providers: Vec<(Participant, SigningKeyPair)>,
    pub(crate) exchange: (Participant, SigningKeyPair),
}

fn participant(id: &str, path: &str, seed: u8) -> (Participant, SigningKeyPair) {
    let key = SigningKeyPair::from_seed(KeyId::new(id, "k1").unwrap(), &[seed; 32]);
    (
        Participant {
            id: id.to_owned(),
            uri: format!("https://{id}/{path}"),
        },
        key,
    )
}

fn build(
    configure: impl FnOnce(CoreConfig) -> CoreConfig,
    sources: ReloadSources,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let bap_key = Arc::new(SigningKeyPair::from_seed(
        KeyId::new("bap.example.org", "k1").unwrap(),
        &[1; 32],
    ));
    let providers = vec![
        participant("bpp2.example.org", "uhi", 2),
        participant("bpp3.example.org", "uhi", 3),
    ];
    let exchange = participant("nhcx.example.org", "claims", 4);
    let registry = Arc::new(TrustedKeyRegistry::with_keys(
        providers
            .iter()
            .chain(std::iter::once(&exchange))
            .map(|(_, key)| key.trusted_key()),
    ));
    let config = CoreConfig::new(
        "bap.example.org".into(),
        "https://bap.example.org/uhi".into(),
    )
    .unwrap()
    .with_gateway_uri("https://gateway.example.org/uhi".into())
    .unwrap()
    .with_claims_exchange_uri(exchange.0.uri.clone())
    .unwrap();
    let transport = Arc::new(RecordingTransport::new());

    let gateway = Gateway::builder(Arc::new(configure(config)), bap_key)
        .with_clock(clock.clone())
        .with_transport(transport.clone())
        .with_trusted_keys(registry)
        .with_reload_sources(sources)
        .build()
        .unwrap();
    let gateway = Arc::new(gateway);
    Harness {
        clock,
        transport,
        machine: Arc::clone(gateway.machine()),
        claims: Arc::clone(gateway.claims()),
        gateway,
        providers,
        exchange,
    }
}

pub(crate) fn harness_with(configure: impl FnOnce(CoreConfig) -> CoreConfig) -> Harness {
    build(configure, ReloadSources::default())
}

pub(crate) fn harness_with_sources(sources: ReloadSources) -> Harness {
    build(|config| config, sources)
}

pub(crate) fn harness() -> Harness {
    harness_with(|config| config)
}

/// Signs the callback `responder` would send in answer to `request`.
fn answer(
    responder: &(Participant, SigningKeyPair),
    request: &SignedEnvelope,
    at: DateTime<Utc>,
    message: Value,
) -> SignedEnvelope {
    let (participant, key) = responder;
    let request = &request.envelope().context;
    let envelope = Envelope {
        context: Context {
            domain: request.domain.clone(),
            action: request.action.callback().unwrap(),
            transaction_id: request.transaction_id,
            message_id: request.message_id,
            bap_id: request.bap_id.clone(),
            bap_uri: request.bap_uri.clone(),
            bpp_id: Some(participant.id.clone()),
            bpp_uri: Some(participant.uri.clone()),
            timestamp: at,
            ttl: 30,
            signature: None,
        },
        message,
    };
    uhi_codec::sign(envelope, key).unwrap()
}

impl Harness {
    /// A callback from provider `n` answering `issued`.
    pub(crate) fn callback(&self, n: usize, issued: &Issued, message: Value) -> SignedEnvelope {
        answer(&self.providers[n], &issued.envelope, self.clock.now(), message)
    }

    /// The claims exchange's answer to `request`.
    pub(crate) fn exchange_answer(&self, request: &SignedEnvelope, message: Value) -> SignedEnvelope {
        answer(&self.exchange, request, self.clock.now(), message)
    }

    /// Waits for the claims request `message_id` to reach the transport.
    pub(crate) async fn claims_request(&self, message_id: MessageId) -> SignedEnvelope {
        for _ in 0..100 {
            let sent = self.transport.sent().await;
            if let Some(found) = sent
                .into_iter()
                .find(|s| s.envelope.envelope().context.message_id == message_id)
            {
                return found.envelope;
            }
            tokio::task::yield_now().await;
        }
        panic!("claims request {message_id} was never sent");
    }

    pub(crate) async fn state(&self, id: TransactionId) -> TransactionState {
        self.machine.state(id).await.unwrap()
    }

    /// Drives a fresh transaction to `Selected` with provider 0.
    pub(crate) async fn selected(&self) -> TransactionId {
        let (participant, _) = self.providers[0].clone();
        let issued = self
            .machine
            .begin_select(participant, json!({"order": {"items": [{"id": "consult-1"}]}}))
            .await
            .unwrap();
        let cb = self.callback(0, &issued, json!({"order": {"quote": {"price": "500"}}}));
        self.machine.handle_callback(&cb).await.unwrap();
        issued.transaction_id
    }

    pub(crate) async fn initiated(&self) -> TransactionId {
        let id = self.selected().await;
        let issued = self.machine.init(id, json!({"order": {}})).await.unwrap();
        let cb = self.callback(0, &issued, json!({"order": {}}));
        self.machine.handle_callback(&cb).await.unwrap();
        id
    }

    /// A granted payment consent letting provider 0 release prescriptions for care context
    /// `cc-1` (the one [`Harness::confirmed`] creates) to this gateway.
    pub(crate) fn claim_consent(&self) -> ClaimConsent {
        let text = |s: &str| NonEmptyText::new(s).unwrap();
        let now = self.clock.now();
        let ledger = self.gateway.consents();
        let artifact = ledger
            .request_consent(
                text("91-1111-2222-3333"),
                Purpose::Hpaymt,
                ConsentScope {
                    hi_types: vec![HiType::Prescription, HiType::DiagnosticReport],
                    date_range: DateRange {
                        from: now - chrono::Duration::days(365),
                        to: now,
                    },
                    data_erase_at: now + chrono::Duration::days(30),
                },
                text("bap.example.org"),
                text(&self.providers[0].0.id),
            )
            .unwrap();
        ledger
            .grant(
                artifact.id,
                PatientAuthorization {
                    method: text("MOBILE_OTP"),
                    proof: text("otp-session-1"),
                },
            )
            .unwrap();
        ledger
            .link_care_context(
                artifact.id,
                CareContext {
                    reference: text("cc-1"),
                    display: None,
                },
            )
            .unwrap();
        ClaimConsent {
            consent_id: artifact.id,
            hi_type: HiType::Prescription,
        }
    }

    pub(crate) async fn confirmed(&self) -> TransactionId {
        let id = self.initiated().await;
        let issued = self.machine.confirm(id, json!({"order": {}})).await.unwrap();
        let cb = self.callback(
            0,
            &issued,
            json!({"order": {"id": "order-1", "care_context_id": "cc-1"}}),
        );
        self.machine.handle_callback(&cb).await.unwrap();
        id
    }
}
