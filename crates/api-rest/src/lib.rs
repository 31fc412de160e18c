//! # API REST
//!
//! REST API for the UHI gateway.
//!
//! Handles:
//! - protocol callbacks (`/on_*`), answered with `ACK`/`NACK`
//! - locally initiated transactions, consent, bundle validation and claims
//! - OpenAPI/Swagger documentation
//!
//! Uses `api-shared` for request/response bodies and caller authentication, and
//! `uhi-core` for everything else.

#![warn(rust_2018_idioms)]

pub mod auth;
pub mod bundles;
pub mod callbacks;
pub mod claims;
pub mod consent;
pub mod error;
pub mod startup;
pub mod transactions;

use api_shared::dto::{
    BundleRes, CancelReq, CancelRes, ClaimRes, ClaimSubmitReq, ConsentCheckReq, ConsentCheckRes,
    ConsentGrantReq, ConsentIdReq, ConsentLinkReq, ConsentRequestReq, ConsentRes,
    DirectSelectReq, ErrorRes, IssuedRes, OrderReq, PreauthReq, ReloadRes, SearchReq, SelectReq,
    TransactionRes,
};
use api_shared::{ApiKeys, HealthRes, HealthService};
use auth::Caller;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use error::ApiResult;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uhi_core::Gateway;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub api_keys: Arc<ApiKeys>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        reload,
        callbacks::receive,
        transactions::search,
        transactions::direct_select,
        transactions::select,
        transactions::init,
        transactions::confirm,
        transactions::status,
        transactions::cancel,
        transactions::close_search,
        transactions::get,
        consent::request,
        consent::grant,
        consent::deny,
        consent::revoke,
        consent::link,
        consent::check,
        consent::get,
        bundles::validate,
        claims::preauth,
        claims::submit,
        claims::status,
    ),
    components(schemas(
        HealthRes,
        ReloadRes,
        ErrorRes,
        SearchReq,
        DirectSelectReq,
        SelectReq,
        OrderReq,
        CancelReq,
        IssuedRes,
        CancelRes,
        TransactionRes,
        ConsentRequestReq,
        ConsentGrantReq,
        ConsentIdReq,
        ConsentLinkReq,
        ConsentCheckReq,
        ConsentCheckRes,
        ConsentRes,
        BundleRes,
        PreauthReq,
        ClaimSubmitReq,
        ClaimRes,
    ))
)]
pub struct ApiDoc;

/// Builds the full router, Swagger UI included.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/admin/reload", post(reload))
        .route("/transactions/search", post(transactions::search))
        .route("/transactions/select", post(transactions::direct_select))
        .route("/transactions/:id", get(transactions::get))
        .route("/transactions/:id/select", post(transactions::select))
        .route("/transactions/:id/init", post(transactions::init))
        .route("/transactions/:id/confirm", post(transactions::confirm))
        .route("/transactions/:id/status", post(transactions::status))
        .route("/transactions/:id/cancel", post(transactions::cancel))
        .route(
            "/transactions/:id/close_search",
            post(transactions::close_search),
        )
        .route("/consent/request", post(consent::request))
        .route("/consent/grant", post(consent::grant))
        .route("/consent/deny", post(consent::deny))
        .route("/consent/revoke", post(consent::revoke))
        .route("/consent/link", post(consent::link))
        .route("/consent/check", post(consent::check))
        .route("/consent/:id", get(consent::get))
        .route("/bundles/validate", post(bundles::validate))
        .route("/claims/preauth", post(claims::preauth))
        .route("/claims/submit", post(claims::submit))
        .route("/claims/:id/status", get(claims::status));
    for path in callbacks::CALLBACK_PATHS {
        app = app.route(path, post(callbacks::receive));
    }

    app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint used by monitoring and load balancers.
pub async fn health() -> Json<HealthRes> {
    Json(HealthService::check_health())
}

#[utoipa::path(
    post,
    path = "/admin/reload",
    responses(
        (status = 200, description = "Registries reloaded", body = ReloadRes),
        (status = 400, description = "A registry file failed to load", body = ErrorRes)
    )
)]
/// Re-reads the trusted keys, terminology sets and external references.
pub async fn reload(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> ApiResult<Json<ReloadRes>> {
    tracing::info!(participant_id = %identity.participant_id, "registry reload requested");
    let report = state.gateway.reload()?;
    Ok(Json(report.into()))
}
