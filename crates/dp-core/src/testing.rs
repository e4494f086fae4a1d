//! In-process stand-ins for the remote collaborators, for unit and
//! integration tests.
//!
//! [`FakeExecutor`] keeps a small model of each host's containers and images
//! and interprets the docker command lines the platform issues, so tests can
//! assert on remote state as well as on the recorded commands.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PlatformError, RemoteError, Result};
use crate::models::{DatabaseServer, HostTarget};
use crate::services::git::SourceFetcher;
use crate::services::remote::{CommandClass, RemoteExecutor};
use crate::services::sql_admin::{DatabaseAdmin, ScopedGrant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub address: String,
    pub command: String,
    pub class: CommandClass,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub image: String,
    pub external_port: u16,
    pub status: String,
    pub state: String,
}

#[derive(Debug, Default)]
struct HostModel {
    containers: BTreeMap<String, FakeContainer>,
    images: HashSet<String>,
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(String),
    Fail(RemoteError),
}

#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<(String, Scripted)>>,
    calls: Mutex<Vec<RecordedCall>>,
    copies: Mutex<Vec<(String, PathBuf, String)>>,
    hosts: Mutex<HashMap<String, HostModel>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn unquote(token: &str) -> String {
    token.trim_matches('\'').trim_matches('"').to_string()
}

fn value_after(tokens: &[&str], flag: &str) -> Option<String> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .map(|t| unquote(t))
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any command containing `needle` with `output`. Later rules win.
    pub fn respond(&self, needle: &str, output: &str) {
        lock(&self.rules).push((needle.to_string(), Scripted::Output(output.to_string())));
    }

    /// Fail any command containing `needle`. Later rules win.
    pub fn fail(&self, needle: &str, err: RemoteError) {
        lock(&self.rules).push((needle.to_string(), Scripted::Fail(err)));
    }

    pub fn clear_rules(&self) {
        lock(&self.rules).clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    pub fn commands_on(&self, address: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.address == address)
            .map(|c| c.command)
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn copies(&self) -> Vec<(String, PathBuf, String)> {
        lock(&self.copies).clone()
    }

    /// Place a container on a host as if it had been started out-of-band.
    pub fn add_container(&self, address: &str, name: &str, image: &str, external_port: u16) {
        let mut hosts = lock(&self.hosts);
        let host = hosts.entry(address.to_string()).or_default();
        host.images.insert(image.to_string());
        host.containers.insert(
            name.to_string(),
            FakeContainer {
                image: image.to_string(),
                external_port,
                status: "Up 2 minutes".into(),
                state: "running".into(),
            },
        );
    }

    /// Delete a container behind the platform's back.
    pub fn kill_container(&self, address: &str, name: &str) {
        if let Some(host) = lock(&self.hosts).get_mut(address) {
            host.containers.remove(name);
        }
    }

    pub fn set_container_status(&self, address: &str, name: &str, status: &str, state: &str) {
        if let Some(c) = lock(&self.hosts)
            .get_mut(address)
            .and_then(|h| h.containers.get_mut(name))
        {
            c.status = status.to_string();
            c.state = state.to_string();
        }
    }

    pub fn containers_on(&self, address: &str) -> Vec<String> {
        lock(&self.hosts)
            .get(address)
            .map(|h| h.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn container(&self, address: &str, name: &str) -> Option<FakeContainer> {
        lock(&self.hosts)
            .get(address)
            .and_then(|h| h.containers.get(name).cloned())
    }

    pub fn images_on(&self, address: &str) -> Vec<String> {
        let mut images: Vec<String> = lock(&self.hosts)
            .get(address)
            .map(|h| h.images.iter().cloned().collect())
            .unwrap_or_default();
        images.sort();
        images
    }

    fn simulate(&self, address: &str, command: &str) -> std::result::Result<String, RemoteError> {
        let mut hosts = lock(&self.hosts);
        let host = hosts.entry(address.to_string()).or_default();
        let tokens: Vec<&str> = command.split_whitespace().collect();

        if command.contains("docker build") {
            if let Some(image) = value_after(&tokens, "-t") {
                host.images.insert(image);
            }
            return Ok(String::new());
        }
        if command.starts_with("docker run") {
            let name = value_after(&tokens, "--name").unwrap_or_default();
            let mapping = value_after(&tokens, "-p").unwrap_or_default();
            let image = tokens.last().map(|t| unquote(t)).unwrap_or_default();
            if !host.images.contains(&image) {
                return Err(RemoteError::CommandFailed {
                    exit_code: Some(125),
                    stderr: format!("Unable to find image '{image}' locally"),
                });
            }
            if host.containers.contains_key(&name) {
                return Err(RemoteError::CommandFailed {
                    exit_code: Some(125),
                    stderr: format!("Conflict. The container name \"/{name}\" is already in use"),
                });
            }
            let external_port = mapping
                .split(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            host.containers.insert(
                name,
                FakeContainer {
                    image,
                    external_port,
                    status: "Up 1 second".into(),
                    state: "running".into(),
                },
            );
            return Ok("f00dfeed".into());
        }
        if command.starts_with("docker stop") {
            if let Some(c) = tokens.get(2).and_then(|n| host.containers.get_mut(&unquote(n))) {
                c.status = "Exited (0) 1 second ago".into();
                c.state = "exited".into();
            }
            return Ok(String::new());
        }
        if command.starts_with("docker rm ") {
            if let Some(name) = tokens.get(2) {
                host.containers.remove(&unquote(name));
            }
            return Ok(String::new());
        }
        if command.starts_with("docker rmi") {
            if let Some(image) = tokens.get(2) {
                host.images.remove(&unquote(image));
            }
            return Ok(String::new());
        }
        if command.starts_with("docker images --filter") {
            // `reference=<repo>:*` matches every tag of that repository only.
            let repository = value_after(&tokens, "--filter")
                .and_then(|f| f.strip_prefix("reference=").map(str::to_string))
                .and_then(|p| p.strip_suffix(":*").map(str::to_string))
                .unwrap_or_default();
            host.images
                .retain(|i| i.rsplit_once(':').map(|(repo, _)| repo) != Some(repository.as_str()));
            return Ok(String::new());
        }
        if command.starts_with("docker image inspect") {
            let image = tokens.get(3).map(|t| unquote(t)).unwrap_or_default();
            return Ok(if host.images.contains(&image) { "yes" } else { "no" }.into());
        }
        if command.starts_with("docker ps --filter publish=") {
            let port: u16 = tokens
                .get(2)
                .and_then(|t| t.strip_prefix("publish="))
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            return Ok(host
                .containers
                .iter()
                .filter(|(_, c)| c.external_port == port && c.state == "running")
                .map(|(n, _)| n.clone())
                .collect::<Vec<_>>()
                .join("\n"));
        }
        if command.starts_with("docker ps -a --filter") {
            let needle = value_after(&tokens, "--filter")
                .and_then(|f| f.strip_prefix("name=").map(str::to_string))
                .unwrap_or_default();
            return Ok(host
                .containers
                .keys()
                .filter(|n| n.contains(&needle))
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"));
        }
        if command.starts_with("docker ps -a --format") {
            return Ok(host
                .containers
                .iter()
                .map(|(n, c)| format!("{n}|{}|{}", c.status, c.state))
                .collect::<Vec<_>>()
                .join("\n"));
        }
        if command.starts_with("echo ok") {
            return Ok("ok".into());
        }
        Ok(String::new())
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        target: &HostTarget,
        command: &str,
        class: CommandClass,
    ) -> std::result::Result<String, RemoteError> {
        lock(&self.calls).push(RecordedCall {
            address: target.address.clone(),
            command: command.to_string(),
            class,
        });
        let scripted = lock(&self.rules)
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, s)| s.clone());
        match scripted {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Fail(err)) => Err(err),
            None => self.simulate(&target.address, command),
        }
    }

    async fn copy_tree(
        &self,
        target: &HostTarget,
        local_dir: &Path,
        remote_parent: &str,
    ) -> std::result::Result<(), RemoteError> {
        let scripted = lock(&self.rules)
            .iter()
            .rev()
            .find(|(needle, _)| needle == "copy_tree")
            .map(|(_, s)| s.clone());
        if let Some(Scripted::Fail(err)) = scripted {
            return Err(err);
        }
        lock(&self.copies).push((
            target.address.clone(),
            local_dir.to_path_buf(),
            remote_parent.to_string(),
        ));
        Ok(())
    }
}

/// A Git source with a settable HEAD and a fixed project tree.
pub struct FakeSource {
    commit: Mutex<String>,
    files: Mutex<Vec<(String, String)>>,
    clones: AtomicUsize,
    lookups: AtomicUsize,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSource {
    /// An Express-style project listening on 5000.
    pub fn new() -> Self {
        Self {
            commit: Mutex::new("1111111111111111111111111111111111111111".into()),
            files: Mutex::new(vec![
                (
                    "package.json".into(),
                    r#"{"name":"shop","scripts":{"start":"node server.js"},"dependencies":{"express":"^4"}}"#
                        .into(),
                ),
                ("server.js".into(), "const app = require('express')();\napp.listen(5000);\n".into()),
            ]),
            clones: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn set_commit(&self, commit: &str) {
        *lock(&self.commit) = commit.to_string();
    }

    pub fn commit(&self) -> String {
        lock(&self.commit).clone()
    }

    pub fn set_file(&self, path: &str, content: &str) {
        let mut files = lock(&self.files);
        files.retain(|(p, _)| p != path);
        files.push((path.to_string(), content.to_string()));
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeSource {
    async fn latest_commit(&self, _url: &str) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.commit())
    }

    async fn clone_repo(&self, url: &str, target: &Path) -> Result<()> {
        if url.contains("unreachable") {
            return Err(PlatformError::Git(format!("git clone failed: repository '{url}' not found")));
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        let files = lock(&self.files).clone();
        for (path, content) in files {
            let path = target.join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    async fn head_commit(&self, _repo: &Path) -> Result<String> {
        Ok(self.commit())
    }
}

/// Records provisioning calls and the objects each server holds; each
/// operation can be made to fail.
#[derive(Default)]
pub struct FakeDatabaseAdmin {
    operations: Mutex<Vec<String>>,
    objects: Mutex<HashSet<(String, String)>>,
    fail_connect: Mutex<bool>,
    fail_create: Mutex<bool>,
    fail_drop: Mutex<bool>,
}

impl FakeDatabaseAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        *lock(&self.fail_connect) = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        *lock(&self.fail_create) = fail;
    }

    pub fn fail_drop(&self, fail: bool) {
        *lock(&self.fail_drop) = fail;
    }

    /// Pretend `name` already exists on `server` as a database or login.
    pub fn add_existing(&self, server: &str, name: &str) {
        lock(&self.objects).insert((server.to_string(), name.to_string()));
    }

    pub fn holds(&self, server: &str, name: &str) -> bool {
        lock(&self.objects).contains(&(server.to_string(), name.to_string()))
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDatabaseAdmin {
    async fn test_connection(&self, server: &DatabaseServer) -> Result<()> {
        lock(&self.operations).push(format!("test {}", server.name));
        if *lock(&self.fail_connect) {
            return Err(PlatformError::Authentication(format!(
                "Access denied for user '{}'",
                server.root_user
            )));
        }
        Ok(())
    }

    async fn create_scoped(&self, server: &DatabaseServer, grant: &ScopedGrant) -> Result<()> {
        lock(&self.operations).push(format!(
            "create {} {} on {}",
            grant.database_name, grant.db_user, server.name
        ));
        let mut objects = lock(&self.objects);
        for name in [&grant.database_name, &grant.db_user] {
            if objects.contains(&(server.name.clone(), name.clone())) {
                return Err(PlatformError::Conflict(format!(
                    "'{name}' already exists on server {}",
                    server.name
                )));
            }
        }
        if *lock(&self.fail_create) {
            return Err(PlatformError::Provisioning("CREATE DATABASE failed".into()));
        }
        objects.insert((server.name.clone(), grant.database_name.clone()));
        objects.insert((server.name.clone(), grant.db_user.clone()));
        Ok(())
    }

    async fn drop_scoped(&self, server: &DatabaseServer, database_name: &str, db_user: &str) -> Result<()> {
        lock(&self.operations).push(format!("drop {database_name} {db_user} on {}", server.name));
        if *lock(&self.fail_drop) {
            return Err(PlatformError::Provisioning("DROP DATABASE failed".into()));
        }
        let mut objects = lock(&self.objects);
        objects.remove(&(server.name.clone(), database_name.to_string()));
        objects.remove(&(server.name.clone(), db_user.to_string()));
        Ok(())
    }
}
