//! Inbound protocol callbacks.
//!
//! Callbacks authenticate by signature, not API key. Every response is a Beckn
//! `ACK`/`NACK` body: `ACK` means the callback was accepted (or was a harmless
//! re-delivery); `NACK` names the reason it was refused.

use crate::error::status_for;
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{MatchedPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uhi_codec::{Action, AckResponse, SignedEnvelope, KEY_ID_HEADER, SIGNATURE_HEADER};
use uhi_core::{
    CallbackOutcome, ClaimCallbackOutcome, GatewayError, InboundOutcome, UnmatchedReason,
};

/// Paths served by [`receive`].
pub const CALLBACK_PATHS: [&str; 8] = [
    "/on_search",
    "/on_select",
    "/on_init",
    "/on_confirm",
    "/on_status",
    "/on_cancel",
    "/on_preauth_submit",
    "/on_claim_submit",
];

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn nack(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<AckResponse>) {
    (status, Json(AckResponse::nack(code, message)))
}

#[utoipa::path(
    post,
    path = "/{callback}",
    params(("callback" = String, Path, description = "on_search, on_select, on_init, on_confirm, on_status, on_cancel, on_preauth_submit or on_claim_submit")),
    responses(
        (status = 200, description = "ACK"),
        (status = 400, description = "NACK: malformed or mismatched envelope"),
        (status = 401, description = "NACK: signature invalid or key unknown"),
        (status = 409, description = "NACK: no outstanding request matches")
    )
)]
/// Receives a signed callback from a provider or the claims exchange.
pub async fn receive(
    State(state): State<AppState>,
    path: MatchedPath,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<AckResponse>) {
    let Some(expected) = Action::parse(path.as_str().trim_start_matches('/')) else {
        return nack(StatusCode::NOT_FOUND, "unknown_action", path.as_str().to_owned());
    };

    let signed = match SignedEnvelope::from_parts(
        &body,
        header(&headers, SIGNATURE_HEADER),
        header(&headers, KEY_ID_HEADER),
    ) {
        Ok(signed) => signed,
        Err(err) => {
            let err = GatewayError::from(err);
            return nack(status_for(&err), err.code(), err.to_string());
        }
    };
    let action = signed.envelope().context.action;
    if action != expected {
        return nack(
            StatusCode::BAD_REQUEST,
            "malformed_envelope",
            format!("{action} posted to {}", path.as_str()),
        );
    }

    match state.gateway.handle_inbound(&signed).await {
        Ok(InboundOutcome::Transaction(CallbackOutcome::Applied { .. }))
        | Ok(InboundOutcome::Claim(ClaimCallbackOutcome::Applied(_))) => {
            (StatusCode::OK, Json(AckResponse::ack()))
        }
        Ok(InboundOutcome::Transaction(CallbackOutcome::Dropped { reason, .. }))
        | Ok(InboundOutcome::Claim(ClaimCallbackOutcome::Dropped(reason))) => dropped(reason),
        Err(err) => nack(status_for(&err), err.code(), err.to_string()),
    }
}

/// Re-deliveries are acknowledged so the sender stops retrying; anything else that
/// matched no outstanding request is refused.
fn dropped(reason: UnmatchedReason) -> (StatusCode, Json<AckResponse>) {
    match reason {
        UnmatchedReason::Duplicate => (StatusCode::OK, Json(AckResponse::ack())),
        other => nack(
            StatusCode::CONFLICT,
            "unmatched",
            format!("callback not accepted: {other}"),
        ),
    }
}
