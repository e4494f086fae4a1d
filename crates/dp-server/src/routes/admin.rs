//! Admin-only routes. The router wraps these in `require_admin`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use dp_core::error::PlatformError;
use dp_core::models::Caller;
use dp_core::services::inventory::{DatabaseServerInput, DockerHostInput};

use super::body;
use super::database::instance_views;
use super::deploy::ListQuery;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/deployments", get(deployments))
        .route("/admin/deployments/:id/move", post(relocate))
        .route("/admin/docker-hosts", get(docker_hosts).post(create_docker_host))
        .route(
            "/admin/docker-hosts/:id",
            get(docker_host).put(update_docker_host).delete(delete_docker_host),
        )
        .route(
            "/admin/database-servers",
            get(database_servers).post(create_database_server),
        )
        .route(
            "/admin/database-servers/:id",
            get(database_server)
                .put(update_database_server)
                .delete(delete_database_server),
        )
        .route("/admin/database-instances", get(database_instances))
}

async fn deployments(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Value> {
    let deployments = state.platform.all_deployments(query.check_status).await;
    Json(json!({ "deployments": deployments }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveRequest {
    new_host_id: Option<Uuid>,
}

async fn relocate(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let new_host_id = body(payload)?
        .new_host_id
        .ok_or_else(|| PlatformError::Validation("Missing required fields: newHostId".into()))?;
    let deployment = state.platform.pipeline().relocate(&caller, id, new_host_id).await?;
    let host = state.platform.inventory().docker_host(new_host_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Deployment moved to {}", host.name),
        "deployment": deployment,
        "host": { "id": host.id, "name": host.name, "host": host.host },
    })))
}

async fn docker_hosts(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "hosts": state.platform.inventory().docker_hosts().await }))
}

async fn docker_host(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let host = state.platform.inventory().docker_host(id).await?;
    Ok(Json(json!({ "host": host })))
}

async fn create_docker_host(
    State(state): State<AppState>,
    payload: Result<Json<DockerHostInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let host = state.platform.inventory().create_docker_host(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "host": host }))))
}

async fn update_docker_host(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<DockerHostInput>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let host = state.platform.inventory().update_docker_host(id, body(payload)?).await?;
    Ok(Json(json!({ "success": true, "host": host })))
}

async fn delete_docker_host(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    state.platform.inventory().delete_docker_host(id).await?;
    Ok(Json(json!({ "success": true, "message": "Docker host deleted" })))
}

async fn database_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "servers": state.platform.inventory().database_servers().await }))
}

async fn database_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let server = state.platform.inventory().database_server(id).await?;
    Ok(Json(json!({ "server": server })))
}

async fn create_database_server(
    State(state): State<AppState>,
    payload: Result<Json<DatabaseServerInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let server = state
        .platform
        .inventory()
        .create_database_server(body(payload)?)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "server": server }))))
}

async fn update_database_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<DatabaseServerInput>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let server = state
        .platform
        .inventory()
        .update_database_server(id, body(payload)?)
        .await?;
    Ok(Json(json!({ "success": true, "server": server })))
}

async fn delete_database_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.platform.inventory().delete_database_server(id).await?;
    Ok(Json(json!({ "success": true, "message": "Database server deleted" })))
}

async fn database_instances(State(state): State<AppState>) -> Json<Value> {
    let store = state.platform.store();
    let instances = store.database_instances().await;
    let servers = store.database_servers().await;
    Json(json!({ "instances": instance_views(instances, &servers, false) }))
}
