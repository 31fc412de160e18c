//! Request and response bodies for the REST surface.
//!
//! Domain records are returned as-is inside a named wrapper; their schema is documented
//! as a free-form object.

use chrono::{DateTime, Utc};
use fhir::{CanonicalBundle, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uhi_core::claims::ClaimCase;
use uhi_core::consent::{
    CareContext, ConsentArtifact, ConsentDecision, ConsentScope, HiType, PatientAuthorization,
    Purpose, ReleaseRequest,
};
use uhi_core::{ReloadReport, Transaction};
use uhi_types::{Amount, NonEmptyText};
use uhi_uuid::{BundleId, ClaimId, ConsentId, MessageId, TransactionId};
use utoipa::ToSchema;

// Transactions

#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchReq {
    #[schema(value_type = Object)]
    pub intent: Value,
}

/// Select from the candidates of a running search.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SelectReq {
    pub bpp_id: String,
    #[schema(value_type = Object)]
    pub order: Value,
}

/// Select directly from a known provider, starting a new transaction.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DirectSelectReq {
    pub bpp_id: String,
    pub bpp_uri: String,
    #[schema(value_type = Object)]
    pub order: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderReq {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub order: Value,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelReq {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IssuedRes {
    #[schema(value_type = String, format = Uuid)]
    pub transaction_id: TransactionId,
    #[schema(value_type = String, format = Uuid)]
    pub message_id: MessageId,
    pub action: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelRes {
    #[schema(value_type = String, format = Uuid)]
    pub transaction_id: TransactionId,
    /// Present when a cancel was sent to the provider.
    #[schema(value_type = Option<String>, format = Uuid)]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionRes {
    #[schema(value_type = Object)]
    pub transaction: Transaction,
}

// Consent

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentRequestReq {
    #[schema(value_type = String)]
    pub patient_id: NonEmptyText,
    /// `CAREMGT`, `BTG`, `PUBHLTH`, `HPAYMT`, `DSRCH` or `PATRQT`.
    #[schema(value_type = String)]
    pub purpose: Purpose,
    #[schema(value_type = Object)]
    pub scope: ConsentScope,
    #[schema(value_type = String)]
    pub hiu_id: NonEmptyText,
    #[schema(value_type = String)]
    pub hip_id: NonEmptyText,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentGrantReq {
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
    #[schema(value_type = Object)]
    pub authorization: PatientAuthorization,
}

/// Body of deny and revoke.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentIdReq {
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentLinkReq {
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
    #[schema(value_type = Object)]
    pub care_context: CareContext,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentCheckReq {
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
    #[schema(value_type = Object)]
    pub release: ReleaseRequest,
    /// Defaults to now.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsentCheckRes {
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
    #[schema(value_type = Object)]
    pub decision: ConsentDecision,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConsentRes {
    #[schema(value_type = Object)]
    pub consent: ConsentArtifact,
}

// Bundles

#[derive(Debug, Serialize, ToSchema)]
pub struct BundleRes {
    #[schema(value_type = Object)]
    pub bundle: CanonicalBundle,
}

// Claims

#[derive(Debug, Deserialize, ToSchema)]
pub struct PreauthReq {
    #[schema(value_type = String, format = Uuid)]
    pub transaction_id: TransactionId,
    /// Granted consent the bundles are released under.
    #[schema(value_type = String, format = Uuid)]
    pub consent_id: ConsentId,
    /// Health information type the bundles carry, e.g. `Prescription`.
    #[schema(value_type = String)]
    pub hi_type: HiType,
    #[schema(value_type = Vec<String>)]
    pub bundle_ids: Vec<BundleId>,
    /// `{"minor_units": 125000, "currency": "INR"}`
    #[schema(value_type = Object)]
    pub amount: Amount,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimSubmitReq {
    #[schema(value_type = String, format = Uuid)]
    pub claim_id: ClaimId,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub supporting_bundle_ids: Vec<BundleId>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimRes {
    #[schema(value_type = Object)]
    pub claim: ClaimCase,
}

// Administration

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReloadRes {
    pub trusted_keys: Option<usize>,
    pub terminology_systems: Option<usize>,
    pub external_references: Option<usize>,
}

impl From<ReloadReport> for ReloadRes {
    fn from(report: ReloadReport) -> Self {
        Self {
            trusted_keys: report.trusted_keys,
            terminology_systems: report.terminology_systems,
            external_references: report.external_references,
        }
    }
}

// Errors

/// Error body for every non-2xx response outside the callback endpoints.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub code: String,
    pub message: String,
    /// Sub-reason for `consent_denied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Every violation for `bundle_validation_failed`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub errors: Vec<ValidationError>,
}

impl ErrorRes {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            reason: None,
            errors: Vec::new(),
        }
    }
}
