use crate::error::ApiError;
use crate::AppState;
use api_shared::{CallerIdentity, API_KEY_HEADER, PATIENT_SESSION_HEADER};
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

/// Extractor for endpoints that need an authenticated participant system.
#[derive(Clone, Debug)]
pub struct Caller(pub CallerIdentity);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        let has_patient_session = parts.headers.contains_key(PATIENT_SESSION_HEADER);
        let identity = state.api_keys.authenticate(api_key, has_patient_session)?;
        tracing::debug!(participant_id = %identity.participant_id, "caller authenticated");
        Ok(Caller(identity))
    }
}
