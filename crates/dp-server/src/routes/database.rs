use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use dp_core::error::PlatformError;
use dp_core::models::{Caller, DatabaseInstance, DatabaseKind, DatabaseServer, InstanceStatus};
use dp_core::services::provisioner::DatabaseRequest;

use super::body;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/database", get(list))
        .route("/database/request", post(request))
        .route("/database/:id/delete", delete(remove))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerSummary {
    id: Uuid,
    name: String,
    host: String,
    port: u16,
    db_type: DatabaseKind,
}

impl From<&DatabaseServer> for ServerSummary {
    fn from(server: &DatabaseServer) -> Self {
        Self {
            id: server.id,
            name: server.name.clone(),
            host: server.host.clone(),
            port: server.port,
            db_type: server.db_type,
        }
    }
}

/// An instance joined with its server. Credentials are only included for
/// the owner's own listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstanceView {
    id: Uuid,
    user_id: String,
    database_name: String,
    db_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_password: Option<String>,
    status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_string: Option<String>,
    created_at: DateTime<Utc>,
    server: Option<ServerSummary>,
}

pub(crate) fn instance_views(
    instances: Vec<DatabaseInstance>,
    servers: &[DatabaseServer],
    with_credentials: bool,
) -> Vec<InstanceView> {
    let by_id: HashMap<Uuid, &DatabaseServer> = servers.iter().map(|s| (s.id, s)).collect();
    instances
        .into_iter()
        .map(|i| InstanceView {
            server: by_id.get(&i.server_id).map(|s| ServerSummary::from(*s)),
            id: i.id,
            user_id: i.user_id,
            database_name: i.database_name,
            db_user: i.db_user,
            db_password: with_credentials.then_some(i.db_password),
            status: i.status,
            connection_string: if with_credentials { i.connection_string } else { None },
            created_at: i.created_at,
        })
        .collect()
}

async fn list(State(state): State<AppState>, Extension(caller): Extension<Caller>) -> Json<Value> {
    let instances = state.platform.databases_for(&caller).await;
    let servers = state.platform.store().database_servers().await;
    let kinds = state.platform.provisioner().available_kinds().await;
    Json(json!({
        "databaseInstances": instance_views(instances, &servers, true),
        "availableDbTypes": kinds,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProvisionBody {
    db_type: Option<String>,
    database_name: Option<String>,
    db_user: Option<String>,
    db_password: Option<String>,
}

impl ProvisionBody {
    fn into_request(self) -> Result<DatabaseRequest, PlatformError> {
        let mut missing = Vec::new();
        let mut take = |value: Option<String>, name: &'static str| {
            let value = value.filter(|v| !v.trim().is_empty());
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };
        let db_type = take(self.db_type, "dbType");
        let database_name = take(self.database_name, "databaseName");
        let db_user = take(self.db_user, "dbUser");
        let db_password = take(self.db_password, "dbPassword");
        if !missing.is_empty() {
            return Err(PlatformError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }
        Ok(DatabaseRequest {
            db_type: db_type.parse().map_err(PlatformError::Validation)?,
            database_name: database_name.trim().to_string(),
            db_user: db_user.trim().to_string(),
            db_password,
        })
    }
}

async fn request(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<ProvisionBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = body(payload)?.into_request()?;
    let provisioned = state.platform.provisioner().provision(&caller, request).await?;
    let instance = provisioned.instance;
    let server = provisioned.server;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Database '{}' created on {}", instance.database_name, server.name),
            "database": {
                "id": instance.id,
                "databaseName": instance.database_name,
                "dbUser": instance.db_user,
                "dbPassword": instance.db_password,
                "host": server.host,
                "port": server.port,
                "dbType": server.db_type,
                "serverName": server.name,
                "connectionString": instance.connection_string,
            },
        })),
    ))
}

async fn remove(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let removed = state.platform.provisioner().deprovision(&caller, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Database '{}' deleted", removed.database_name),
    })))
}
