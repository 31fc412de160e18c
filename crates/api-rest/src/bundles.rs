use crate::auth::Caller;
use crate::error::ApiResult;
use crate::AppState;
use api_shared::dto::{BundleRes, ErrorRes};
use axum::extract::State;
use axum::Json;
use serde_json::Value;

#[utoipa::path(
    post,
    path = "/bundles/validate",
    responses(
        (status = 200, description = "Canonical bundle", body = BundleRes),
        (status = 422, description = "Every validation error found", body = ErrorRes)
    )
)]
/// Validates and normalises a clinical bundle; valid bundles become usable by claims.
pub async fn validate(
    State(state): State<AppState>,
    _caller: Caller,
    Json(bundle): Json<Value>,
) -> ApiResult<Json<BundleRes>> {
    let bundle = state.gateway.validate_bundle(&bundle)?;
    Ok(Json(BundleRes { bundle }))
}
