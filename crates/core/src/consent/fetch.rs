use super::{ConsentDecision, ConsentLedger, ReleaseRequest};
use crate::{GatewayError, GatewayResult};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uhi_uuid::ConsentId;

/// Handle held for the duration of a data fetch.
///
/// The fetch loop calls [`FetchGuard::ensure_active`] before releasing each chunk and can
/// race its I/O against [`FetchGuard::revoked`] to abort as soon as the consent is revoked.
#[derive(Debug)]
pub struct FetchGuard {
    ledger: Arc<ConsentLedger>,
    consent_id: ConsentId,
    request: ReleaseRequest,
    revocations: broadcast::Receiver<ConsentId>,
}

impl FetchGuard {
    pub(super) fn new(
        ledger: Arc<ConsentLedger>,
        consent_id: ConsentId,
        request: ReleaseRequest,
        revocations: broadcast::Receiver<ConsentId>,
    ) -> Self {
        Self {
            ledger,
            consent_id,
            request,
            revocations,
        }
    }

    pub fn consent_id(&self) -> ConsentId {
        self.consent_id
    }

    /// Re-checks the ledger; never answers from a cached decision.
    pub fn ensure_active(&self) -> GatewayResult<()> {
        match self
            .ledger
            .check_release(self.consent_id, self.ledger.now(), &self.request)
        {
            ConsentDecision::Allowed => Ok(()),
            ConsentDecision::Denied(reason) => Err(GatewayError::ConsentDenied(reason)),
        }
    }

    /// Completes once this guard's consent has been revoked.
    pub async fn revoked(&mut self) {
        loop {
            match self.revocations.recv().await {
                Ok(id) if id == self.consent_id => return,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "revocation receiver lagged; re-checking ledger");
                    if self.ensure_active().is_err() {
                        return;
                    }
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}
