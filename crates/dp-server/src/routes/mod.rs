use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};

use dp_core::services::platform::HealthReport;

use crate::auth::{require_admin, require_session};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub mod admin;
pub mod database;
pub mod deploy;

pub fn router(state: AppState) -> Router {
    let admin = admin::routes().route_layer(middleware::from_fn(require_admin));
    let protected = Router::new()
        .merge(deploy::routes())
        .merge(database::routes())
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.platform.health().await)
}

/// Unwrap a JSON body, turning axum's plain-text rejection into our error shape.
pub(crate) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}
