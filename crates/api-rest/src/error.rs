//! Mapping of core errors onto HTTP responses.

use api_shared::dto::ErrorRes;
use api_shared::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uhi_core::GatewayError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorRes,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorRes::new(code, message),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", what)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }

    pub fn message(&self) -> &str {
        &self.body.message
    }
}

/// HTTP status for each error kind.
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::SignatureInvalid(_) | GatewayError::UnknownKey(_) => {
            StatusCode::UNAUTHORIZED
        }
        GatewayError::Expired(_)
        | GatewayError::MalformedEnvelope(_)
        | GatewayError::InvalidInput(_)
        | GatewayError::Serialization(_) => StatusCode::BAD_REQUEST,
        GatewayError::DuplicateOutstanding { .. }
        | GatewayError::InvalidState { .. }
        | GatewayError::Unmatched(_) => StatusCode::CONFLICT,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::ConsentDenied(_) => StatusCode::FORBIDDEN,
        GatewayError::BundleValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code(), "request failed: {err}");
        }
        let mut body = ErrorRes::new(err.code(), err.to_string());
        match err {
            GatewayError::ConsentDenied(reason) => body.reason = Some(reason.to_string()),
            GatewayError::BundleValidationFailed(errors) => body.errors = errors,
            _ => {}
        }
        Self { status, body }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let (status, code) = match err {
            AuthError::MissingKey | AuthError::InvalidKey => {
                (StatusCode::UNAUTHORIZED, "unauthenticated")
            }
            AuthError::PatientSession => (StatusCode::FORBIDDEN, "patient_session_refused"),
            AuthError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "auth_config"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
