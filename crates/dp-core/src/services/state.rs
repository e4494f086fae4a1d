use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::models::{DatabaseInstance, DatabaseServer, Deployment, DockerHost};

/// Everything the platform persists, as written to the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub deployments: Vec<Deployment>,
    pub docker_hosts: Vec<DockerHost>,
    pub database_servers: Vec<DatabaseServer>,
    pub database_instances: Vec<DatabaseInstance>,
}

/// Repository for the four platform entities.
///
/// Mutations run against a copy of the data and only replace it once the
/// state file has been written, so a failed write leaves memory and disk in
/// agreement. Uniqueness and referential constraints are checked here.
pub struct Store {
    state_file_path: Option<PathBuf>,
    data: RwLock<Snapshot>,
}

impl Store {
    pub async fn open(state_file_path: &Path) -> Result<Self> {
        let data = if state_file_path.exists() {
            let json = tokio::fs::read_to_string(state_file_path)
                .await
                .map_err(|e| PlatformError::State(format!("failed to read state file: {e}")))?;
            if json.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&json)?
            }
        } else {
            Snapshot::default()
        };
        Ok(Self {
            state_file_path: Some(state_file_path.to_path_buf()),
            data: RwLock::new(data),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            state_file_path: None,
            data: RwLock::new(Snapshot::default()),
        }
    }

    pub fn state_file_path(&self) -> Option<&Path> {
        self.state_file_path.as_deref()
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = &self.state_file_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlatformError::State(format!("failed to create state dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| PlatformError::State(format!("failed to write state file: {e}")))?;
        tokio::fs::rename(&temp, path)
            .await
            .map_err(|e| PlatformError::State(format!("failed to replace state file: {e}")))?;
        Ok(())
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        self.save(&next).await?;
        *guard = next;
        Ok(value)
    }

    /// Whether the state file can currently be read back.
    pub async fn is_healthy(&self) -> bool {
        match &self.state_file_path {
            Some(path) => !path.exists() || tokio::fs::metadata(path).await.is_ok(),
            None => true,
        }
    }

    // --- deployments ---

    /// All deployments, newest first.
    pub async fn deployments(&self) -> Vec<Deployment> {
        let mut all = self.data.read().await.deployments.clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub async fn deployments_for_user(&self, user_id: &str) -> Vec<Deployment> {
        let mut mine: Vec<Deployment> = self
            .data
            .read()
            .await
            .deployments
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        mine
    }

    pub async fn deployment(&self, id: Uuid) -> Result<Deployment> {
        self.data
            .read()
            .await
            .deployments
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("deployment {id}")))
    }

    pub async fn find_deployment(&self, user_id: &str, project_name: &str) -> Option<Deployment> {
        self.data
            .read()
            .await
            .deployments
            .iter()
            .find(|d| d.user_id == user_id && d.project_name == project_name)
            .cloned()
    }

    pub async fn insert_deployment(&self, deployment: Deployment) -> Result<Deployment> {
        self.mutate(|data| {
            if let Some(existing) = data
                .deployments
                .iter()
                .find(|d| d.user_id == deployment.user_id && d.project_name == deployment.project_name)
            {
                return Err(PlatformError::Conflict(format!(
                    "project '{}' is already deployed (deployment {}); use update instead",
                    existing.project_name, existing.id
                )));
            }
            data.deployments.push(deployment.clone());
            Ok(deployment)
        })
        .await
    }

    pub async fn update_deployment<F>(&self, id: Uuid, f: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        self.mutate(|data| {
            let deployment = data
                .deployments
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("deployment {id}")))?;
            f(deployment);
            deployment.touch();
            Ok(deployment.clone())
        })
        .await
    }

    pub async fn remove_deployment(&self, id: Uuid) -> Result<Deployment> {
        self.mutate(|data| {
            let index = data
                .deployments
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("deployment {id}")))?;
            Ok(data.deployments.remove(index))
        })
        .await
    }

    /// External ports recorded by any deployment.
    pub async fn recorded_ports(&self) -> HashSet<u16> {
        self.data
            .read()
            .await
            .deployments
            .iter()
            .map(|d| d.port)
            .collect()
    }

    // --- docker hosts ---

    /// All hosts, oldest first.
    pub async fn docker_hosts(&self) -> Vec<DockerHost> {
        let mut hosts = self.data.read().await.docker_hosts.clone();
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        hosts
    }

    pub async fn docker_host(&self, id: Uuid) -> Result<DockerHost> {
        self.data
            .read()
            .await
            .docker_hosts
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("docker host {id}")))
    }

    pub async fn insert_docker_host(&self, host: DockerHost) -> Result<DockerHost> {
        self.mutate(|data| {
            ensure_unique_host(&data.docker_hosts, &host)?;
            data.docker_hosts.push(host.clone());
            Ok(host)
        })
        .await
    }

    pub async fn update_docker_host<F>(&self, id: Uuid, f: F) -> Result<DockerHost>
    where
        F: FnOnce(&mut DockerHost),
    {
        self.mutate(|data| {
            let index = data
                .docker_hosts
                .iter()
                .position(|h| h.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("docker host {id}")))?;
            let mut host = data.docker_hosts[index].clone();
            f(&mut host);
            host.updated_at = chrono::Utc::now();
            ensure_unique_host(&data.docker_hosts, &host)?;
            data.docker_hosts[index] = host.clone();
            Ok(host)
        })
        .await
    }

    pub async fn remove_docker_host(&self, id: Uuid) -> Result<DockerHost> {
        self.mutate(|data| {
            let index = data
                .docker_hosts
                .iter()
                .position(|h| h.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("docker host {id}")))?;
            let dependents = data
                .deployments
                .iter()
                .filter(|d| d.host_id == Some(id))
                .count();
            if dependents > 0 {
                return Err(PlatformError::ResourceInUse(format!(
                    "docker host '{}' is used by {dependents} deployment(s)",
                    data.docker_hosts[index].name
                )));
            }
            Ok(data.docker_hosts.remove(index))
        })
        .await
    }

    pub async fn deployment_count(&self, host_id: Uuid) -> usize {
        self.data
            .read()
            .await
            .deployments
            .iter()
            .filter(|d| d.host_id == Some(host_id))
            .count()
    }

    // --- database servers ---

    /// All servers, oldest first.
    pub async fn database_servers(&self) -> Vec<DatabaseServer> {
        let mut servers = self.data.read().await.database_servers.clone();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        servers
    }

    pub async fn database_server(&self, id: Uuid) -> Result<DatabaseServer> {
        self.data
            .read()
            .await
            .database_servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("database server {id}")))
    }

    pub async fn insert_database_server(&self, server: DatabaseServer) -> Result<DatabaseServer> {
        self.mutate(|data| {
            data.database_servers.push(server.clone());
            Ok(server)
        })
        .await
    }

    pub async fn update_database_server<F>(&self, id: Uuid, f: F) -> Result<DatabaseServer>
    where
        F: FnOnce(&mut DatabaseServer),
    {
        self.mutate(|data| {
            let server = data
                .database_servers
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("database server {id}")))?;
            f(server);
            server.updated_at = chrono::Utc::now();
            Ok(server.clone())
        })
        .await
    }

    pub async fn remove_database_server(&self, id: Uuid) -> Result<DatabaseServer> {
        self.mutate(|data| {
            let index = data
                .database_servers
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("database server {id}")))?;
            let dependents = data
                .database_instances
                .iter()
                .filter(|i| i.server_id == id)
                .count();
            if dependents > 0 {
                return Err(PlatformError::ResourceInUse(format!(
                    "database server '{}' still hosts {dependents} instance(s)",
                    data.database_servers[index].name
                )));
            }
            Ok(data.database_servers.remove(index))
        })
        .await
    }

    pub async fn instance_count(&self, server_id: Uuid) -> usize {
        self.data
            .read()
            .await
            .database_instances
            .iter()
            .filter(|i| i.server_id == server_id)
            .count()
    }

    // --- database instances ---

    /// All instances, newest first.
    pub async fn database_instances(&self) -> Vec<DatabaseInstance> {
        let mut all = self.data.read().await.database_instances.clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub async fn instances_for_user(&self, user_id: &str) -> Vec<DatabaseInstance> {
        let mut mine: Vec<DatabaseInstance> = self
            .data
            .read()
            .await
            .database_instances
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        mine
    }

    pub async fn database_instance(&self, id: Uuid) -> Result<DatabaseInstance> {
        self.data
            .read()
            .await
            .database_instances
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("database instance {id}")))
    }

    /// Name of the first identity already taken on `server_id`, if any.
    pub async fn instance_identity_taken(
        &self,
        server_id: Uuid,
        database_name: &str,
        db_user: &str,
    ) -> Option<String> {
        identity_conflict(
            &self.data.read().await.database_instances,
            server_id,
            database_name,
            db_user,
        )
    }

    pub async fn insert_database_instance(
        &self,
        instance: DatabaseInstance,
    ) -> Result<DatabaseInstance> {
        self.mutate(|data| {
            if !data.database_servers.iter().any(|s| s.id == instance.server_id) {
                return Err(PlatformError::NotFound(format!(
                    "database server {}",
                    instance.server_id
                )));
            }
            if let Some(conflict) = identity_conflict(
                &data.database_instances,
                instance.server_id,
                &instance.database_name,
                &instance.db_user,
            ) {
                return Err(PlatformError::Conflict(conflict));
            }
            data.database_instances.push(instance.clone());
            Ok(instance)
        })
        .await
    }

    pub async fn update_database_instance<F>(&self, id: Uuid, f: F) -> Result<DatabaseInstance>
    where
        F: FnOnce(&mut DatabaseInstance),
    {
        self.mutate(|data| {
            let instance = data
                .database_instances
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("database instance {id}")))?;
            f(instance);
            Ok(instance.clone())
        })
        .await
    }

    pub async fn remove_database_instance(&self, id: Uuid) -> Result<DatabaseInstance> {
        self.mutate(|data| {
            let index = data
                .database_instances
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| PlatformError::NotFound(format!("database instance {id}")))?;
            Ok(data.database_instances.remove(index))
        })
        .await
    }
}

fn ensure_unique_host(hosts: &[DockerHost], candidate: &DockerHost) -> Result<()> {
    match hosts
        .iter()
        .find(|h| h.id != candidate.id && h.host == candidate.host && h.user == candidate.user)
    {
        Some(existing) => Err(PlatformError::Conflict(format!(
            "docker host {}@{} is already registered as '{}'",
            candidate.user, candidate.host, existing.name
        ))),
        None => Ok(()),
    }
}

fn identity_conflict(
    instances: &[DatabaseInstance],
    server_id: Uuid,
    database_name: &str,
    db_user: &str,
) -> Option<String> {
    let on_server = || instances.iter().filter(|i| i.server_id == server_id);
    if on_server().any(|i| i.database_name == database_name) {
        Some(format!("database '{database_name}' already exists on this server"))
    } else if on_server().any(|i| i.db_user == db_user) {
        Some(format!("database user '{db_user}' already exists on this server"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, DeploymentStatus, InstanceStatus};

    fn deployment(user: &str, project: &str, port: u16) -> Deployment {
        Deployment::new(
            user.into(),
            user.into(),
            project.into(),
            format!("https://git.example.com/{user}/{project}.git"),
            port,
            None,
        )
    }

    fn server() -> DatabaseServer {
        DatabaseServer::new(
            "mysql-a".into(),
            "db.internal".into(),
            None,
            DatabaseKind::Mysql,
            "root".into(),
            "secret".into(),
        )
    }

    fn instance(server_id: Uuid, name: &str, user: &str) -> DatabaseInstance {
        DatabaseInstance {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            server_id,
            database_name: name.into(),
            db_user: user.into(),
            db_password: "pw".into(),
            status: InstanceStatus::Active,
            provisioned: true,
            connection_string: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trip_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("state.json");
        let store = Store::open(&path).await.unwrap();
        let d = store
            .insert_deployment(deployment("u1", "shop", 8000))
            .await
            .unwrap();
        store
            .update_deployment(d.id, |d| {
                d.status = DeploymentStatus::Running;
                d.internal_port = Some(5173);
            })
            .await
            .unwrap();

        let reopened = Store::open(&path).await.unwrap();
        let loaded = reopened.deployment(d.id).await.unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Running);
        assert_eq!(loaded.internal_port, Some(5173));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn state_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::open(&path).await.unwrap();
        store
            .insert_deployment(deployment("u1", "shop", 8000))
            .await
            .unwrap();

        let json = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(json.contains("\"projectName\""));
        assert!(json.contains("\"gitUrl\""));
        assert!(json.contains("\"dockerHosts\""));
        assert!(!json.contains("\"project_name\""));
    }

    #[tokio::test]
    async fn duplicate_project_is_a_conflict() {
        let store = Store::in_memory();
        let first = store
            .insert_deployment(deployment("u1", "shop", 8000))
            .await
            .unwrap();
        let err = store
            .insert_deployment(deployment("u1", "shop", 8001))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
        assert_eq!(store.deployment(first.id).await.unwrap().port, 8000);
        // Another user may deploy the same project.
        store
            .insert_deployment(deployment("u2", "shop", 8001))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn host_in_use_cannot_be_removed() {
        let store = Store::in_memory();
        let host = store
            .insert_docker_host(DockerHost::new(
                "edge".into(),
                "10.0.0.5".into(),
                "deploy".into(),
                None,
            ))
            .await
            .unwrap();
        let mut d = deployment("u1", "shop", 8000);
        d.host_id = Some(host.id);
        let d = store.insert_deployment(d).await.unwrap();

        let err = store.remove_docker_host(host.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::ResourceInUse(_)));

        store.remove_deployment(d.id).await.unwrap();
        store.remove_docker_host(host.id).await.unwrap();
    }

    #[tokio::test]
    async fn host_identity_is_unique() {
        let store = Store::in_memory();
        store
            .insert_docker_host(DockerHost::new("a".into(), "10.0.0.5".into(), "deploy".into(), None))
            .await
            .unwrap();
        let err = store
            .insert_docker_host(DockerHost::new("b".into(), "10.0.0.5".into(), "deploy".into(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
    }

    #[tokio::test]
    async fn instance_identity_is_unique_per_server() {
        let store = Store::in_memory();
        let a = store.insert_database_server(server()).await.unwrap();
        let b = store.insert_database_server(server()).await.unwrap();
        store
            .insert_database_instance(instance(a.id, "shop", "shop_rw"))
            .await
            .unwrap();

        let err = store
            .insert_database_instance(instance(a.id, "shop", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
        let err = store
            .insert_database_instance(instance(a.id, "other", "shop_rw"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));

        store
            .insert_database_instance(instance(b.id, "shop", "shop_rw"))
            .await
            .unwrap();
        assert_eq!(store.instance_count(a.id).await, 1);
    }

    #[tokio::test]
    async fn server_with_instances_cannot_be_removed() {
        let store = Store::in_memory();
        let s = store.insert_database_server(server()).await.unwrap();
        let i = store
            .insert_database_instance(instance(s.id, "shop", "shop_rw"))
            .await
            .unwrap();
        assert!(matches!(
            store.remove_database_server(s.id).await,
            Err(PlatformError::ResourceInUse(_))
        ));
        store.remove_database_instance(i.id).await.unwrap();
        store.remove_database_server(s.id).await.unwrap();
    }
}
