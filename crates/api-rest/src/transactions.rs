//! Locally initiated transactions.
//!
//! Each request returns as soon as the outbound message is signed and queued (202); the
//! provider's answer arrives later on a callback endpoint and shows up in
//! `GET /transactions/{id}`.

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use api_shared::dto::{
    CancelReq, CancelRes, DirectSelectReq, ErrorRes, IssuedRes, OrderReq, SearchReq,
    SelectReq, TransactionRes,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use uhi_core::transaction::Participant;
use uhi_core::Issued;
use uhi_uuid::TransactionId;

fn accepted(issued: Issued, caller: &Caller) -> (StatusCode, Json<IssuedRes>) {
    let action = issued.envelope.envelope().context.action;
    tracing::info!(
        transaction_id = %issued.transaction_id,
        action = %action,
        participant_id = %caller.0.participant_id,
        "request queued"
    );
    (
        StatusCode::ACCEPTED,
        Json(IssuedRes {
            transaction_id: issued.transaction_id,
            message_id: issued.message_id,
            action: action.to_string(),
        }),
    )
}

#[utoipa::path(
    post,
    path = "/transactions/search",
    request_body = SearchReq,
    responses(
        (status = 202, description = "Search broadcast queued", body = IssuedRes),
        (status = 412, description = "No network gateway configured", body = ErrorRes)
    )
)]
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<SearchReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    let issued = state.gateway.machine().search(req.intent).await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/select",
    request_body = DirectSelectReq,
    responses(
        (status = 202, description = "Select queued for a new transaction", body = IssuedRes),
        (status = 400, description = "Invalid provider", body = ErrorRes)
    )
)]
pub async fn direct_select(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<DirectSelectReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    if req.bpp_id.trim().is_empty() || req.bpp_uri.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "bpp_id and bpp_uri are required",
        ));
    }
    let provider = Participant {
        id: req.bpp_id,
        uri: req.bpp_uri,
    };
    let issued = state.gateway.machine().begin_select(provider, req.order).await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/select",
    params(("id" = String, Path, description = "Transaction id")),
    request_body = SelectReq,
    responses(
        (status = 202, description = "Select queued", body = IssuedRes),
        (status = 409, description = "Illegal in the current state", body = ErrorRes)
    )
)]
pub async fn select(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<TransactionId>,
    Json(req): Json<SelectReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    let issued = state
        .gateway
        .machine()
        .select(id, &req.bpp_id, req.order)
        .await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/init",
    params(("id" = String, Path, description = "Transaction id")),
    request_body = OrderReq,
    responses(
        (status = 202, description = "Init queued", body = IssuedRes),
        (status = 409, description = "Illegal in the current state", body = ErrorRes)
    )
)]
pub async fn init(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<TransactionId>,
    Json(req): Json<OrderReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    let issued = state.gateway.machine().init(id, req.order).await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/confirm",
    params(("id" = String, Path, description = "Transaction id")),
    request_body = OrderReq,
    responses(
        (status = 202, description = "Confirm queued", body = IssuedRes),
        (status = 409, description = "Illegal in the current state", body = ErrorRes)
    )
)]
pub async fn confirm(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<TransactionId>,
    Json(req): Json<OrderReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    let issued = state.gateway.machine().confirm(id, req.order).await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/status",
    params(("id" = String, Path, description = "Transaction id")),
    request_body = OrderReq,
    responses(
        (status = 202, description = "Status request queued", body = IssuedRes),
        (status = 409, description = "Illegal in the current state", body = ErrorRes)
    )
)]
pub async fn status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<TransactionId>,
    Json(req): Json<OrderReq>,
) -> ApiResult<(StatusCode, Json<IssuedRes>)> {
    let issued = state.gateway.machine().status(id, req.order).await?;
    Ok(accepted(issued, &caller))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/cancel",
    params(("id" = String, Path, description = "Transaction id")),
    request_body = CancelReq,
    responses(
        (status = 200, description = "Transaction cancelled", body = CancelRes),
        (status = 409, description = "Transaction already terminal", body = ErrorRes)
    )
)]
pub async fn cancel(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<TransactionId>,
    Json(req): Json<CancelReq>,
) -> ApiResult<Json<CancelRes>> {
    let reason = json!({ "reason": req.reason });
    let issued = state.gateway.machine().cancel(id, reason).await?;
    tracing::info!(
        transaction_id = %id,
        participant_id = %identity.participant_id,
        "transaction cancelled"
    );
    Ok(Json(CancelRes {
        transaction_id: id,
        message_id: issued.map(|i| i.message_id),
    }))
}

#[utoipa::path(
    post,
    path = "/transactions/{id}/close_search",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Search collection closed", body = TransactionRes),
        (status = 409, description = "Transaction is not searching", body = ErrorRes)
    )
)]
pub async fn close_search(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<TransactionId>,
) -> ApiResult<Json<TransactionRes>> {
    let transaction = state.gateway.machine().close_search(id).await?;
    Ok(Json(TransactionRes { transaction }))
}

#[utoipa::path(
    get,
    path = "/transactions/{id}",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Transaction snapshot", body = TransactionRes),
        (status = 404, description = "Unknown transaction", body = ErrorRes)
    )
)]
pub async fn get(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<TransactionId>,
) -> ApiResult<Json<TransactionRes>> {
    let transaction = state
        .gateway
        .machine()
        .snapshot(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("transaction {id}")))?;
    Ok(Json(TransactionRes { transaction }))
}
