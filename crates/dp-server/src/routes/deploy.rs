use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use dp_core::models::Caller;
use dp_core::services::pipeline::UpdateOutcome;

use super::body;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/deploy", post(create).get(list))
        .route("/deploy/:id/start", post(start))
        .route("/deploy/:id/stop", post(stop))
        .route("/deploy/:id/update", post(update))
        .route("/deploy/:id/delete", delete(remove))
        .route("/deploy/:id", get(show))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest {
    #[serde(default)]
    git_url: String,
    host_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListQuery {
    #[serde(default)]
    pub check_status: bool,
}

async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = body(payload)?;
    let deployment = state
        .platform
        .pipeline()
        .create(&caller, &request.git_url, request.host_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Deployment started. Check status for progress.",
            "deployment": deployment,
        })),
    ))
}

async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let deployments = state.platform.deployments_for(&caller, query.check_status).await;
    Json(json!({
        "deployments": deployments,
        "user": { "username": caller.username, "totalDeployments": deployments.len() },
    }))
}

async fn show(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deployment = state.platform.deployment_for(&caller, id).await?;
    Ok(Json(json!({ "deployment": deployment })))
}

async fn start(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deployment = state.platform.pipeline().start(&caller, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Deployment started successfully",
        "deployment": deployment,
    })))
}

async fn stop(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deployment = state.platform.pipeline().stop(&caller, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Deployment stopped successfully",
        "deployment": deployment,
    })))
}

async fn update(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let response = match state.platform.pipeline().update(&caller, id).await? {
        UpdateOutcome::UpToDate(deployment) => json!({
            "success": true,
            "upToDate": true,
            "message": "Already up to date",
            "deployment": deployment,
        }),
        UpdateOutcome::Updated(deployment) => json!({
            "success": true,
            "upToDate": false,
            "message": "Deployment updated successfully",
            "deployment": deployment,
        }),
    };
    Ok(Json(response))
}

async fn remove(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let removed = state.platform.pipeline().delete(&caller, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Deployment '{}' deleted", removed.project_name),
    })))
}
