//! Claims endpoints.

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use api_shared::dto::{ClaimRes, ClaimSubmitReq, ErrorRes, PreauthReq};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uhi_core::claims::ClaimConsent;
use uhi_uuid::ClaimId;

#[utoipa::path(
    post,
    path = "/claims/preauth",
    request_body = PreauthReq,
    responses(
        (status = 202, description = "Pre-authorisation sent", body = ClaimRes),
        (status = 403, description = "Consent does not allow the release", body = ErrorRes),
        (status = 412, description = "Transaction not confirmed or bundles not validated", body = ErrorRes)
    )
)]
pub async fn preauth(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<PreauthReq>,
) -> ApiResult<(StatusCode, Json<ClaimRes>)> {
    let claim = state
        .gateway
        .claims()
        .request_preauth(
            req.transaction_id,
            ClaimConsent {
                consent_id: req.consent_id,
                hi_type: req.hi_type,
            },
            req.bundle_ids,
            req.amount,
        )
        .await?;
    tracing::info!(
        claim_id = %claim.id,
        participant_id = %identity.participant_id,
        "pre-authorisation submitted"
    );
    Ok((StatusCode::ACCEPTED, Json(ClaimRes { claim })))
}

#[utoipa::path(
    post,
    path = "/claims/submit",
    request_body = ClaimSubmitReq,
    responses(
        (status = 202, description = "Claim sent", body = ClaimRes),
        (status = 403, description = "Consent no longer allows the release", body = ErrorRes),
        (status = 409, description = "Pre-authorisation not approved", body = ErrorRes),
        (status = 412, description = "Supporting bundles not validated", body = ErrorRes)
    )
)]
pub async fn submit(
    State(state): State<AppState>,
    _caller: Caller,
    Json(req): Json<ClaimSubmitReq>,
) -> ApiResult<(StatusCode, Json<ClaimRes>)> {
    let claim = state
        .gateway
        .claims()
        .submit_claim(req.claim_id, req.supporting_bundle_ids)?;
    Ok((StatusCode::ACCEPTED, Json(ClaimRes { claim })))
}

#[utoipa::path(
    get,
    path = "/claims/{id}/status",
    params(("id" = String, Path, description = "Claim id")),
    responses(
        (status = 200, description = "Claim case", body = ClaimRes),
        (status = 404, description = "Unknown claim", body = ErrorRes)
    )
)]
pub async fn status(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<ClaimId>,
) -> ApiResult<Json<ClaimRes>> {
    let claim = state
        .gateway
        .claims()
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("claim {id}")))?;
    Ok(Json(ClaimRes { claim }))
}
