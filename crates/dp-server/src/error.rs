use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use dp_core::error::PlatformError;

/// Errors returned from handlers, rendered as `{"error", "details"}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Platform(PlatformError),
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        ApiError::Platform(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn status_of(err: &PlatformError) -> (StatusCode, &'static str) {
    match err {
        PlatformError::Validation(_) | PlatformError::InvalidDescriptor { .. } => {
            (StatusCode::BAD_REQUEST, "Invalid request")
        }
        PlatformError::InvalidTransition { .. } => {
            (StatusCode::BAD_REQUEST, "Invalid state for this operation")
        }
        PlatformError::Forbidden(_) => (StatusCode::FORBIDDEN, "Access denied"),
        PlatformError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
        PlatformError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
        PlatformError::Busy(_) => (StatusCode::CONFLICT, "Operation in progress"),
        PlatformError::ResourceInUse(_) => (StatusCode::CONFLICT, "Resource in use"),
        PlatformError::Authentication(_) => (StatusCode::BAD_GATEWAY, "Authentication failed"),
        PlatformError::Connectivity(_) => (StatusCode::BAD_GATEWAY, "Connection failed"),
        PlatformError::ToolUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Remote tooling unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Platform(err) => status_of(err).0,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, summary, details) = match &self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "Unauthorized", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Invalid request", msg.clone()),
            ApiError::Platform(err) => {
                let (status, summary) = status_of(err);
                (status, summary, err.to_string())
            }
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %details, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %details, "request rejected");
        }
        (status, Json(json!({ "error": summary, "details": details }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn platform_errors_map_to_status_codes() {
        let cases = [
            (PlatformError::Validation("x".into()), 400),
            (
                PlatformError::InvalidTransition {
                    action: "stop",
                    status: "stopped".into(),
                },
                400,
            ),
            (PlatformError::Forbidden("x".into()), 403),
            (PlatformError::NotFound("x".into()), 404),
            (PlatformError::Busy(Uuid::nil()), 409),
            (PlatformError::ResourceInUse("x".into()), 409),
            (PlatformError::Authentication("x".into()), 502),
            (PlatformError::Connectivity("x".into()), 502),
            (PlatformError::ToolUnavailable("x".into()), 503),
            (PlatformError::Build("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status().as_u16(), code);
        }
        assert_eq!(ApiError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
    }
}
