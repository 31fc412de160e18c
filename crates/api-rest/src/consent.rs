//! Consent ledger endpoints.

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use api_shared::dto::{
    ConsentCheckReq, ConsentCheckRes, ConsentGrantReq, ConsentIdReq, ConsentLinkReq,
    ConsentRequestReq, ConsentRes, ErrorRes,
};
use api_shared::CallerIdentity;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uhi_core::consent::ConsentArtifact;
use uhi_core::Clock;
use uhi_uuid::ConsentId;

#[utoipa::path(
    post,
    path = "/consent/request",
    request_body = ConsentRequestReq,
    responses(
        (status = 201, description = "Consent requested", body = ConsentRes),
        (status = 400, description = "Invalid scope", body = ErrorRes),
        (status = 401, description = "Missing or invalid API key", body = ErrorRes),
        (status = 403, description = "Patient session tokens are refused, or the caller is neither HIU nor HIP", body = ErrorRes)
    )
)]
/// Records a consent request on behalf of an HIU.
pub async fn request(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentRequestReq>,
) -> ApiResult<(StatusCode, Json<ConsentRes>)> {
    ensure_party(&identity, req.hiu_id.as_str(), req.hip_id.as_str())?;
    let consent = state.gateway.consents().request_consent(
        req.patient_id,
        req.purpose,
        req.scope,
        req.hiu_id,
        req.hip_id,
    )?;
    tracing::info!(
        consent_id = %consent.id,
        participant_id = %identity.participant_id,
        "consent requested"
    );
    Ok((StatusCode::CREATED, Json(ConsentRes { consent })))
}

#[utoipa::path(
    post,
    path = "/consent/grant",
    request_body = ConsentGrantReq,
    responses(
        (status = 200, description = "Consent granted", body = ConsentRes),
        (status = 403, description = "Caller is not a party to the consent", body = ErrorRes),
        (status = 404, description = "Unknown consent", body = ErrorRes),
        (status = 409, description = "Consent is not awaiting a decision", body = ErrorRes)
    )
)]
pub async fn grant(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentGrantReq>,
) -> ApiResult<Json<ConsentRes>> {
    party_consent(&state, &identity, req.consent_id)?;
    let consent = state
        .gateway
        .consents()
        .grant(req.consent_id, req.authorization)?;
    Ok(Json(ConsentRes { consent }))
}

#[utoipa::path(
    post,
    path = "/consent/deny",
    request_body = ConsentIdReq,
    responses(
        (status = 200, description = "Consent denied", body = ConsentRes),
        (status = 403, description = "Caller is not a party to the consent", body = ErrorRes),
        (status = 409, description = "Consent is not awaiting a decision", body = ErrorRes)
    )
)]
pub async fn deny(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentIdReq>,
) -> ApiResult<Json<ConsentRes>> {
    party_consent(&state, &identity, req.consent_id)?;
    let consent = state.gateway.consents().deny(req.consent_id)?;
    Ok(Json(ConsentRes { consent }))
}

#[utoipa::path(
    post,
    path = "/consent/revoke",
    request_body = ConsentIdReq,
    responses(
        (status = 200, description = "Consent revoked (idempotent)", body = ConsentRes),
        (status = 403, description = "Caller is not a party to the consent", body = ErrorRes),
        (status = 409, description = "Consent already denied or expired", body = ErrorRes)
    )
)]
/// Revokes a consent. Takes effect before the response is sent.
pub async fn revoke(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentIdReq>,
) -> ApiResult<Json<ConsentRes>> {
    party_consent(&state, &identity, req.consent_id)?;
    let consent = state.gateway.consents().revoke(req.consent_id)?;
    tracing::info!(
        consent_id = %consent.id,
        participant_id = %identity.participant_id,
        "consent revoked"
    );
    Ok(Json(ConsentRes { consent }))
}

#[utoipa::path(
    post,
    path = "/consent/link",
    request_body = ConsentLinkReq,
    responses(
        (status = 200, description = "Care context linked", body = ConsentRes),
        (status = 403, description = "Caller is not a party to the consent", body = ErrorRes),
        (status = 409, description = "Consent is not granted", body = ErrorRes)
    )
)]
pub async fn link(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentLinkReq>,
) -> ApiResult<Json<ConsentRes>> {
    party_consent(&state, &identity, req.consent_id)?;
    let consent = state
        .gateway
        .consents()
        .link_care_context(req.consent_id, req.care_context)?;
    Ok(Json(ConsentRes { consent }))
}

#[utoipa::path(
    post,
    path = "/consent/check",
    request_body = ConsentCheckReq,
    responses(
        (status = 200, description = "Release decision", body = ConsentCheckRes),
        (status = 403, description = "Caller is not a party to the release", body = ErrorRes)
    )
)]
/// Decides whether a concrete release is covered by a consent.
pub async fn check(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(req): Json<ConsentCheckReq>,
) -> ApiResult<Json<ConsentCheckRes>> {
    ensure_party(&identity, &req.release.hiu_id, &req.release.hip_id)?;
    let at = req.at.unwrap_or_else(|| state.gateway.clock().now());
    let decision = state
        .gateway
        .consents()
        .check_release(req.consent_id, at, &req.release);
    Ok(Json(ConsentCheckRes {
        consent_id: req.consent_id,
        decision,
    }))
}

#[utoipa::path(
    get,
    path = "/consent/{id}",
    params(("id" = String, Path, description = "Consent id")),
    responses(
        (status = 200, description = "Consent artifact", body = ConsentRes),
        (status = 403, description = "Caller is not a party to the consent", body = ErrorRes),
        (status = 404, description = "Unknown consent", body = ErrorRes)
    )
)]
pub async fn get(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<ConsentId>,
) -> ApiResult<Json<ConsentRes>> {
    let consent = party_consent(&state, &identity, id)?;
    Ok(Json(ConsentRes { consent }))
}

/// Only the requesting HIU and the releasing HIP may act on a consent.
fn ensure_party(identity: &CallerIdentity, hiu_id: &str, hip_id: &str) -> ApiResult<()> {
    let caller = identity.participant_id.as_str();
    if caller == hiu_id || caller == hip_id {
        return Ok(());
    }
    tracing::warn!(participant_id = %caller, "caller is not a party to the consent");
    Err(ApiError::new(
        StatusCode::FORBIDDEN,
        "forbidden",
        format!("{caller} is neither the HIU nor the HIP of this consent"),
    ))
}

/// Loads a consent the caller is a party to.
fn party_consent(
    state: &AppState,
    identity: &CallerIdentity,
    consent_id: ConsentId,
) -> ApiResult<ConsentArtifact> {
    let consent = state
        .gateway
        .consents()
        .get(consent_id)
        .ok_or_else(|| ApiError::not_found(format!("consent {consent_id}")))?;
    ensure_party(identity, consent.hiu_id.as_str(), consent.hip_id.as_str())?;
    Ok(consent)
}
