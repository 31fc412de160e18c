//! Consent artifact model.
//!
//! Status, grant time and terms hash are only writable from the ledger; everything outside
//! `consent` reads them through accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uhi_types::NonEmptyText;
use uhi_uuid::ConsentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Requested,
    Granted,
    Denied,
    Revoked,
    Expired,
}

impl ConsentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsentStatus::Denied | ConsentStatus::Revoked | ConsentStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Requested => "requested",
            ConsentStatus::Granted => "granted",
            ConsentStatus::Denied => "denied",
            ConsentStatus::Revoked => "revoked",
            ConsentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purpose of use codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Purpose {
    /// Care management
    Caremgt,
    /// Break the glass
    Btg,
    /// Public health
    Pubhlth,
    /// Healthcare payment
    Hpaymt,
    /// Disease-specific healthcare research
    Dsrch,
    /// Self requested
    Patrqt,
}

/// Health information categories a consent can cover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HiType {
    OPConsultation,
    Prescription,
    DischargeSummary,
    DiagnosticReport,
    ImmunizationRecord,
    HealthDocumentRecord,
    WellnessRecord,
}

/// Inclusive range of record dates a consent covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentScope {
    pub hi_types: Vec<HiType>,
    pub date_range: DateRange,
    /// Access ends, and fetched data must be erased, at this instant.
    pub data_erase_at: DateTime<Utc>,
}

/// Link between the patient's identity at a HIP and one episode of care.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CareContext {
    pub reference: NonEmptyText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Evidence that the patient approved a consent request.
///
/// Only a digest of the proof is retained on the artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientAuthorization {
    /// e.g. `MOBILE_OTP`, `AADHAAR_OTP`, `DEMOGRAPHICS`
    pub method: NonEmptyText,
    pub proof: NonEmptyText,
}

/// Why a data release was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotGranted,
    Expired,
    Revoked,
    OutOfScope,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::NotGranted => "not_granted",
            DenyReason::Expired => "expired",
            DenyReason::Revoked => "revoked",
            DenyReason::OutOfScope => "out_of_scope",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum ConsentDecision {
    Allowed,
    Denied(DenyReason),
}

impl ConsentDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsentDecision::Allowed)
    }
}

/// What a data release is about to hand over, checked against the consent scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub hiu_id: String,
    pub hip_id: String,
    pub hi_type: HiType,
    #[serde(default)]
    pub record_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub care_context: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentArtifact {
    pub id: ConsentId,
    pub patient_id: NonEmptyText,
    pub purpose: Purpose,
    pub scope: ConsentScope,
    pub hiu_id: NonEmptyText,
    pub hip_id: NonEmptyText,
    pub(super) status: ConsentStatus,
    pub requested_at: DateTime<Utc>,
    pub(super) updated_at: DateTime<Utc>,
    #[serde(default)]
    pub(super) granted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(super) terms_hash: Option<String>,
    #[serde(default)]
    pub(super) authorization_digest: Option<String>,
    #[serde(default)]
    pub(super) care_contexts: Vec<CareContext>,
}

impl ConsentArtifact {
    pub fn status(&self) -> ConsentStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn granted_at(&self) -> Option<DateTime<Utc>> {
        self.granted_at
    }

    /// SHA-256 (hex) of the canonical granted terms.
    pub fn terms_hash(&self) -> Option<&str> {
        self.terms_hash.as_deref()
    }

    pub fn care_contexts(&self) -> &[CareContext] {
        &self.care_contexts
    }

    /// Scope test for a release; status and time are checked separately.
    pub(super) fn covers(&self, request: &ReleaseRequest) -> bool {
        if request.hiu_id != self.hiu_id.as_str() || request.hip_id != self.hip_id.as_str() {
            return false;
        }
        if !self.scope.hi_types.contains(&request.hi_type) {
            return false;
        }
        if let Some(record_date) = request.record_date {
            if !self.scope.date_range.contains(record_date) {
                return false;
            }
        }
        if let Some(reference) = &request.care_context {
            if !self
                .care_contexts
                .iter()
                .any(|c| c.reference.as_str() == reference)
            {
                return false;
            }
        }
        true
    }
}
