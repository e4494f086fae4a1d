//! Admin management of the shared Docker hosts and database servers.
//!
//! Role checks happen at the HTTP layer; nothing here looks at the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::models::{DatabaseKind, DatabaseServer, DockerHost, HostTarget};
use crate::services::remote::{CommandClass, RemoteExecutor};
use crate::services::sql_admin::DatabaseAdmin;
use crate::services::state::Store;

/// Fields accepted when creating or updating a Docker host. Absent fields
/// are left unchanged on update.
#[derive(Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerHostInput {
    pub name: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub test_connection: bool,
}

/// A Docker host as shown to admins. Never carries the password.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerHostView {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub user: String,
    pub has_password: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub deployment_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DockerHostView {
    fn new(host: DockerHost, deployment_count: usize) -> Self {
        Self {
            id: host.id,
            has_password: host.password.is_some(),
            name: host.name,
            host: host.host,
            user: host.user,
            description: host.description,
            is_active: host.is_active,
            deployment_count,
            created_at: host.created_at,
            updated_at: host.updated_at,
        }
    }
}

#[derive(Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseServerInput {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_type: Option<DatabaseKind>,
    pub root_user: Option<String>,
    pub root_pass: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// A database server as shown to admins. Never carries the root password.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseServerView {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub db_type: DatabaseKind,
    pub root_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub instance_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseServerView {
    fn new(server: DatabaseServer, instance_count: usize) -> Self {
        Self {
            id: server.id,
            name: server.name,
            host: server.host,
            port: server.port,
            db_type: server.db_type,
            root_user: server.root_user,
            description: server.description,
            is_active: server.is_active,
            instance_count,
            created_at: server.created_at,
            updated_at: server.updated_at,
        }
    }
}

fn required(field: Option<String>, missing: &mut Vec<&'static str>, name: &'static str) -> String {
    match field.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(value) => value,
        None => {
            missing.push(name);
            String::new()
        }
    }
}

/// Like [`required`] but keeps surrounding whitespace.
fn secret(field: Option<String>, missing: &mut Vec<&'static str>, name: &'static str) -> String {
    match field.filter(|v| !v.is_empty()) {
        Some(value) => value,
        None => {
            missing.push(name);
            String::new()
        }
    }
}

fn missing_fields(missing: &[&str]) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PlatformError::Validation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )))
    }
}

pub struct Inventory {
    store: Arc<Store>,
    executor: Arc<dyn RemoteExecutor>,
    admin: Arc<dyn DatabaseAdmin>,
}

impl Inventory {
    pub fn new(store: Arc<Store>, executor: Arc<dyn RemoteExecutor>, admin: Arc<dyn DatabaseAdmin>) -> Self {
        Self {
            store,
            executor,
            admin,
        }
    }

    // --- docker hosts ---

    pub async fn docker_hosts(&self) -> Vec<DockerHostView> {
        let mut views = Vec::new();
        for host in self.store.docker_hosts().await {
            let count = self.store.deployment_count(host.id).await;
            views.push(DockerHostView::new(host, count));
        }
        views
    }

    pub async fn docker_host(&self, id: Uuid) -> Result<DockerHostView> {
        let host = self.store.docker_host(id).await?;
        let count = self.store.deployment_count(id).await;
        Ok(DockerHostView::new(host, count))
    }

    /// Run `echo ok` on the host under the probe timeout.
    pub async fn test_docker_host(&self, target: &HostTarget) -> Result<()> {
        let output = self.executor.run(target, "echo ok", CommandClass::Probe).await?;
        if output.trim() == "ok" {
            Ok(())
        } else {
            Err(PlatformError::Connectivity(format!(
                "unexpected reply from {}: {}",
                target.login(),
                output.trim()
            )))
        }
    }

    pub async fn create_docker_host(&self, input: DockerHostInput) -> Result<DockerHostView> {
        let mut missing = Vec::new();
        let name = required(input.name, &mut missing, "name");
        let address = required(input.host, &mut missing, "host");
        let user = required(input.user, &mut missing, "user");
        missing_fields(&missing)?;

        let mut host = DockerHost::new(name, address, user, input.password);
        host.description = input.description.filter(|d| !d.trim().is_empty());
        if let Some(active) = input.is_active {
            host.is_active = active;
        }
        if input.test_connection {
            self.test_docker_host(&host.target()).await?;
        }

        let host = self.store.insert_docker_host(host).await?;
        info!(host = %host.name, login = %host.target().login(), "docker host registered");
        Ok(DockerHostView::new(host, 0))
    }

    pub async fn update_docker_host(&self, id: Uuid, input: DockerHostInput) -> Result<DockerHostView> {
        let mut merged = self.store.docker_host(id).await?;
        apply_host_input(&mut merged, input.clone());
        if input.test_connection {
            self.test_docker_host(&merged.target()).await?;
        }

        let host = self
            .store
            .update_docker_host(id, |h| apply_host_input(h, input))
            .await?;
        info!(host = %host.name, active = host.is_active, "docker host updated");
        let count = self.store.deployment_count(id).await;
        Ok(DockerHostView::new(host, count))
    }

    pub async fn delete_docker_host(&self, id: Uuid) -> Result<()> {
        let removed = self.store.remove_docker_host(id).await?;
        info!(host = %removed.name, "docker host removed");
        Ok(())
    }

    // --- database servers ---

    pub async fn database_servers(&self) -> Vec<DatabaseServerView> {
        let mut views = Vec::new();
        for server in self.store.database_servers().await {
            let count = self.store.instance_count(server.id).await;
            views.push(DatabaseServerView::new(server, count));
        }
        views
    }

    pub async fn database_server(&self, id: Uuid) -> Result<DatabaseServerView> {
        let server = self.store.database_server(id).await?;
        let count = self.store.instance_count(id).await;
        Ok(DatabaseServerView::new(server, count))
    }

    /// Register a server after its admin credentials have been verified.
    pub async fn create_database_server(&self, input: DatabaseServerInput) -> Result<DatabaseServerView> {
        let mut missing = Vec::new();
        let name = required(input.name, &mut missing, "name");
        let host = required(input.host, &mut missing, "host");
        let root_user = required(input.root_user, &mut missing, "rootUser");
        let root_pass = secret(input.root_pass, &mut missing, "rootPass");
        if input.db_type.is_none() {
            missing.push("dbType");
        }
        missing_fields(&missing)?;
        let db_type = input
            .db_type
            .ok_or_else(|| PlatformError::Validation("Missing required fields: dbType".into()))?;

        let mut server = DatabaseServer::new(name, host, input.port, db_type, root_user, root_pass);
        server.description = input.description.filter(|d| !d.trim().is_empty());
        if let Some(active) = input.is_active {
            server.is_active = active;
        }
        self.admin.test_connection(&server).await?;

        let server = self.store.insert_database_server(server).await?;
        info!(server = %server.name, kind = %server.db_type, "database server registered");
        Ok(DatabaseServerView::new(server, 0))
    }

    /// Partial update; changed connection details are verified first.
    pub async fn update_database_server(
        &self,
        id: Uuid,
        input: DatabaseServerInput,
    ) -> Result<DatabaseServerView> {
        let current = self.store.database_server(id).await?;
        let mut merged = current.clone();
        apply_server_input(&mut merged, input.clone());
        let reconnect = merged.host != current.host
            || merged.port != current.port
            || merged.db_type != current.db_type
            || merged.root_user != current.root_user
            || merged.root_pass != current.root_pass;
        if reconnect {
            self.admin.test_connection(&merged).await?;
        }

        let server = self
            .store
            .update_database_server(id, |s| apply_server_input(s, input))
            .await?;
        info!(server = %server.name, active = server.is_active, "database server updated");
        let count = self.store.instance_count(id).await;
        Ok(DatabaseServerView::new(server, count))
    }

    pub async fn delete_database_server(&self, id: Uuid) -> Result<()> {
        let removed = self.store.remove_database_server(id).await?;
        info!(server = %removed.name, "database server removed");
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_host_input(host: &mut DockerHost, input: DockerHostInput) {
    if let Some(name) = non_empty(input.name) {
        host.name = name;
    }
    if let Some(address) = non_empty(input.host) {
        host.host = address;
    }
    if let Some(user) = non_empty(input.user) {
        host.user = user;
    }
    // An explicit empty password switches the host to key authentication.
    if let Some(password) = input.password {
        host.password = Some(password).filter(|p| !p.is_empty());
    }
    if let Some(description) = input.description {
        host.description = Some(description).filter(|d| !d.trim().is_empty());
    }
    if let Some(active) = input.is_active {
        host.is_active = active;
    }
}

fn apply_server_input(server: &mut DatabaseServer, input: DatabaseServerInput) {
    if let Some(name) = non_empty(input.name) {
        server.name = name;
    }
    if let Some(host) = non_empty(input.host) {
        server.host = host;
    }
    if let Some(db_type) = input.db_type {
        if db_type != server.db_type && input.port.is_none() {
            server.port = db_type.default_port();
        }
        server.db_type = db_type;
    }
    if let Some(port) = input.port {
        server.port = port;
    }
    if let Some(root_user) = non_empty(input.root_user) {
        server.root_user = root_user;
    }
    if let Some(root_pass) = input.root_pass.filter(|p| !p.is_empty()) {
        server.root_pass = root_pass;
    }
    if let Some(description) = input.description {
        server.description = Some(description).filter(|d| !d.trim().is_empty());
    }
    if let Some(active) = input.is_active {
        server.is_active = active;
    }
}
