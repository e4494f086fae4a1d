use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::models::deployment::{project_name_from_url, sanitize_name};
use crate::models::{Caller, Deployment, DeploymentStatus, HostTarget, PlatformSettings};
use crate::services::git::{validate_git_url, SourceFetcher};
use crate::services::image_spec::{ImageSpec, ProjectManifest};
use crate::services::ports::{self, PortFinder, ProbeOutcome};
use crate::services::remote::{CommandClass, RemoteExecutor};
use crate::services::scheduler::HostScheduler;
use crate::services::state::Store;
use crate::services::supervisor::{KeyedLocks, TaskSupervisor};
use crate::services::{descriptor_loader, docker, port_detector};

/// Result of an update request.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The remote HEAD matches the deployed commit; nothing was rebuilt.
    UpToDate(Deployment),
    Updated(Deployment),
}

/// What a successful clone-build-run produced.
#[derive(Debug)]
struct BuildOutcome {
    container: String,
    image: String,
    commit: String,
    internal_port: u16,
    deploy_url: String,
}

/// Drives deployments through their lifecycle on remote Docker hosts.
///
/// Every operation on a deployment holds that deployment's lock for its whole
/// duration, including the background phase of a create. A second operation
/// arriving meanwhile is rejected with [`PlatformError::Busy`].
pub struct DeploymentPipeline {
    store: Arc<Store>,
    executor: Arc<dyn RemoteExecutor>,
    source: Arc<dyn SourceFetcher>,
    scheduler: Arc<HostScheduler>,
    ports: PortFinder,
    locks: KeyedLocks<Uuid>,
    supervisor: TaskSupervisor,
    settings: PlatformSettings,
}

impl DeploymentPipeline {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<dyn RemoteExecutor>,
        source: Arc<dyn SourceFetcher>,
        scheduler: Arc<HostScheduler>,
        settings: PlatformSettings,
    ) -> Self {
        Self {
            ports: PortFinder::new(&settings),
            locks: KeyedLocks::new(),
            supervisor: TaskSupervisor::new(Arc::clone(&store)),
            store,
            executor,
            source,
            scheduler,
            settings,
        }
    }

    /// Register a deployment and start building it in the background.
    ///
    /// Returns the provisional `building` record as soon as it is persisted.
    pub async fn create(
        self: &Arc<Self>,
        caller: &Caller,
        git_url: &str,
        requested_host: Option<Uuid>,
    ) -> Result<Deployment> {
        let git_url = git_url.trim();
        if git_url.is_empty() {
            return Err(PlatformError::Validation("Git URL is required".into()));
        }
        validate_git_url(git_url)?;
        let project_name = project_name_from_url(git_url).ok_or_else(|| {
            PlatformError::Validation(format!("cannot derive a project name from '{git_url}'"))
        })?;

        if self.store.find_deployment(&caller.user_id, &project_name).await.is_some() {
            return Err(PlatformError::Conflict(format!(
                "Project '{project_name}' is already deployed"
            )));
        }

        let placement = self.scheduler.place(&self.store, caller, requested_host).await?;
        let reservation = self
            .ports
            .allocate(&self.store, self.executor.as_ref(), &placement.target)
            .await?;

        let mut deployment = Deployment::new(
            caller.user_id.clone(),
            caller.username.clone(),
            project_name,
            git_url.to_string(),
            reservation.port(),
            placement.host_id,
        );
        deployment.message = Some("Preparing deployment".into());
        // Held from before the record is visible so no other operation can
        // slip in ahead of the build.
        let guard = self.lock(deployment.id)?;
        let deployment = self.store.insert_deployment(deployment).await?;
        // The record now holds the port.
        drop(reservation);

        info!(
            deployment_id = %deployment.id,
            project = %deployment.project_name,
            port = deployment.port,
            login = %placement.target.login(),
            "deployment created"
        );

        let pipeline = Arc::clone(self);
        let record = deployment.clone();
        self.supervisor
            .spawn(deployment.id, async move {
                let _guard = guard;
                pipeline.run_create(record, placement.target).await;
            })
            .await;

        Ok(deployment)
    }

    async fn run_create(&self, deployment: Deployment, target: HostTarget) {
        let id = deployment.id;
        match self.rebuild(&deployment, &target).await {
            Ok(outcome) => match self.finish(id, outcome).await {
                Ok(d) => info!(deployment_id = %id, url = ?d.deploy_url, "deployment running"),
                Err(e) => error!(deployment_id = %id, error = %e, "could not record finished deployment"),
            },
            Err(e) => {
                error!(deployment_id = %id, error = %e, "deployment failed");
                self.mark_failed(id, format!("Deployment failed: {e}")).await;
            }
        }
    }

    /// Rebuild from the latest commit if the remote moved on.
    pub async fn update(&self, caller: &Caller, id: Uuid) -> Result<UpdateOutcome> {
        let _guard = self.lock(id)?;
        let deployment = self.authorized(caller, id).await?;

        let latest = self.source.latest_commit(&deployment.git_url).await?;
        if deployment.last_commit_hash.as_deref() == Some(latest.as_str()) {
            debug!(deployment_id = %id, commit = %latest, "already up to date");
            let current = self
                .store
                .update_deployment(id, |d| d.message = None)
                .await?;
            return Ok(UpdateOutcome::UpToDate(current));
        }

        let target = self.scheduler.target_for(&self.store, &deployment).await?;
        let short = latest.get(..7).unwrap_or(&latest);
        let deployment = self
            .store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Building;
                d.message = Some(format!("Updating to {short}"));
            })
            .await?;

        // Stop what is running now
        match &deployment.container_name {
            Some(container) => {
                if let Err(e) = docker::stop_and_remove(self.executor.as_ref(), &target, container).await {
                    warn!(deployment_id = %id, container, error = %e, "failed to stop previous container");
                }
            }
            None => {
                if let Err(e) =
                    docker::remove_owned_containers(self.executor.as_ref(), &target, &deployment, None).await
                {
                    warn!(deployment_id = %id, error = %e, "failed to discover previous containers");
                }
            }
        }

        match self.rebuild(&deployment, &target).await {
            Ok(outcome) => {
                let new_image = outcome.image.clone();
                let updated = self.finish(id, outcome).await?;
                if let Some(old) = deployment.image_name.as_deref().filter(|old| *old != new_image) {
                    if let Err(e) = self
                        .executor
                        .run(&target, &docker::remove_image(old), CommandClass::Standard)
                        .await
                    {
                        warn!(deployment_id = %id, image = old, error = %e, "failed to remove previous image");
                    }
                }
                info!(deployment_id = %id, commit = %latest, "deployment updated");
                Ok(UpdateOutcome::Updated(updated))
            }
            Err(e) => {
                error!(deployment_id = %id, error = %e, "update failed");
                self.mark_failed(id, format!("Update failed: {e}")).await;
                Err(e)
            }
        }
    }

    /// Run a fresh container from the image already on the host.
    pub async fn start(&self, caller: &Caller, id: Uuid) -> Result<Deployment> {
        let _guard = self.lock(id)?;
        let deployment = self.authorized(caller, id).await?;
        if !deployment.status.can_start() {
            return Err(PlatformError::InvalidTransition {
                action: "start",
                status: deployment.status.to_string(),
            });
        }

        let target = self.scheduler.target_for(&self.store, &deployment).await?;
        let image = match deployment.image_name.clone() {
            Some(image) if self.image_present(&target, &image).await? => image,
            _ => {
                return Err(PlatformError::Validation(
                    "No image is available for this deployment; run an update to rebuild it".into(),
                ))
            }
        };

        let clash = self
            .store
            .deployments()
            .await
            .into_iter()
            .find(|other| other.id != id && other.port == deployment.port && other.status.holds_port());
        if let Some(other) = clash {
            return Err(PlatformError::Conflict(format!(
                "port {} is held by deployment '{}'",
                deployment.port, other.project_name
            )));
        }

        self.store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Building;
                d.message = Some("Starting container".into());
            })
            .await?;

        if let Some(stale) = &deployment.container_name {
            if let Err(e) = docker::stop_and_remove(self.executor.as_ref(), &target, stale).await {
                warn!(deployment_id = %id, container = stale, error = %e, "failed to remove stale container");
            }
        }
        if let Err(e) =
            docker::remove_owned_containers(self.executor.as_ref(), &target, &deployment, None).await
        {
            warn!(deployment_id = %id, error = %e, "failed to remove leftover containers");
        }

        let container = deployment.container_name_at(Utc::now().timestamp_millis());
        let internal_port = deployment.internal_port.unwrap_or(port_detector::DEFAULT_PORT);
        let run = docker::run_container(&container, deployment.port, internal_port, &image);
        if let Err(e) = self.executor.run(&target, &run, CommandClass::Standard).await {
            let e = docker::stage_error(PlatformError::Runtime, e);
            error!(deployment_id = %id, error = %e, "start failed");
            self.mark_failed(id, format!("Start failed: {e}")).await;
            return Err(e);
        }

        let url = target.public_url(deployment.port);
        let started = self
            .store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Running;
                d.container_name = Some(container);
                d.deploy_url = Some(url);
                d.message = None;
            })
            .await?;
        info!(deployment_id = %id, "deployment started");
        Ok(started)
    }

    pub async fn stop(&self, caller: &Caller, id: Uuid) -> Result<Deployment> {
        let _guard = self.lock(id)?;
        let deployment = self.authorized(caller, id).await?;
        if !deployment.status.can_stop() {
            return Err(PlatformError::InvalidTransition {
                action: "stop",
                status: deployment.status.to_string(),
            });
        }

        let target = self.scheduler.target_for(&self.store, &deployment).await?;
        let stopped = match &deployment.container_name {
            Some(container) => docker::stop_and_remove(self.executor.as_ref(), &target, container)
                .await
                .map_err(PlatformError::from),
            None => docker::remove_owned_containers(self.executor.as_ref(), &target, &deployment, None)
                .await
                .map(|_| ()),
        };
        if let Err(e) = stopped {
            error!(deployment_id = %id, error = %e, "stop failed");
            self.mark_failed(id, format!("Stop failed: {e}")).await;
            return Err(e);
        }

        let stopped = self
            .store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Stopped;
                d.message = None;
            })
            .await?;
        info!(deployment_id = %id, "deployment stopped");
        Ok(stopped)
    }

    /// Tear down everything on the host, then drop the record whatever the
    /// cleanup managed.
    pub async fn delete(&self, caller: &Caller, id: Uuid) -> Result<Deployment> {
        let _guard = self.lock(id)?;
        let deployment = self.authorized(caller, id).await?;

        match self.scheduler.target_for(&self.store, &deployment).await {
            Ok(target) => {
                docker::purge_deployment(
                    self.executor.as_ref(),
                    &target,
                    &deployment,
                    &self.settings.remote_root,
                )
                .await
            }
            Err(e) => warn!(deployment_id = %id, error = %e, "skipping remote cleanup"),
        }

        let removed = self.store.remove_deployment(id).await?;
        info!(deployment_id = %id, project = %removed.project_name, "deployment deleted");
        Ok(removed)
    }

    /// Rebuild a deployment on another host. Admin only.
    ///
    /// The host reference is repointed before the rebuild and stays repointed
    /// if the rebuild fails.
    pub async fn relocate(&self, caller: &Caller, id: Uuid, new_host_id: Uuid) -> Result<Deployment> {
        if !caller.is_admin() {
            return Err(PlatformError::Forbidden("Admin access required".into()));
        }
        let _guard = self.lock(id)?;
        let deployment = self.store.deployment(id).await?;
        let new_host = self
            .scheduler
            .validate_move(&self.store, &deployment, new_host_id)
            .await?;
        let new_target = new_host.target();

        if ports::probe(self.executor.as_ref(), &new_target, deployment.port).await == ProbeOutcome::Busy {
            return Err(PlatformError::Conflict(format!(
                "port {} is already in use on {}",
                deployment.port, new_host.name
            )));
        }

        // Clear out the old host
        match self.scheduler.target_for(&self.store, &deployment).await {
            Ok(old_target) => {
                docker::purge_deployment(
                    self.executor.as_ref(),
                    &old_target,
                    &deployment,
                    &self.settings.remote_root,
                )
                .await
            }
            Err(e) => warn!(deployment_id = %id, error = %e, "old host unavailable; skipping cleanup"),
        }

        let moving = self
            .store
            .update_deployment(id, |d| {
                d.host_id = Some(new_host.id);
                d.status = DeploymentStatus::Building;
                d.container_name = None;
                d.image_name = None;
                d.deploy_url = None;
                d.message = Some(format!("Moving to {}", new_host.name));
            })
            .await?;
        info!(deployment_id = %id, host = %new_host.name, "moving deployment");

        match self.rebuild(&moving, &new_target).await {
            Ok(outcome) => self.finish(id, outcome).await,
            Err(e) => {
                error!(deployment_id = %id, host = %new_host.name, error = %e, "move failed");
                self.mark_failed(id, format!("Move failed: {e}")).await;
                Err(e)
            }
        }
    }

    /// Wait for the background phase of a create, if one is running.
    pub async fn wait(&self, id: Uuid) {
        self.supervisor.wait(id).await;
    }

    pub async fn in_flight(&self) -> usize {
        self.supervisor.in_flight().await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    fn lock(&self, id: Uuid) -> Result<OwnedMutexGuard<()>> {
        self.locks.try_acquire(&id).ok_or(PlatformError::Busy(id))
    }

    /// Load a deployment the caller owns (or any, for admins).
    pub async fn authorized(&self, caller: &Caller, id: Uuid) -> Result<Deployment> {
        let deployment = self.store.deployment(id).await?;
        if !caller.may_manage(&deployment.user_id) {
            return Err(PlatformError::Forbidden(
                "You do not have access to this deployment".into(),
            ));
        }
        Ok(deployment)
    }

    async fn image_present(&self, target: &HostTarget, image: &str) -> Result<bool> {
        let answer = self
            .executor
            .run(target, &docker::image_exists(image), CommandClass::Standard)
            .await?;
        Ok(answer.trim() == "yes")
    }

    async fn progress(&self, id: Uuid, message: impl Into<String>) {
        let message = message.into();
        debug!(deployment_id = %id, message, "progress");
        if let Err(e) = self
            .store
            .update_deployment(id, |d| d.message = Some(message))
            .await
        {
            warn!(deployment_id = %id, error = %e, "could not record progress");
        }
    }

    async fn mark_failed(&self, id: Uuid, cause: String) {
        let marked = self
            .store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Failed;
                d.message = Some(cause);
            })
            .await;
        if let Err(e) = marked {
            warn!(deployment_id = %id, error = %e, "could not record failure");
        }
    }

    async fn finish(&self, id: Uuid, outcome: BuildOutcome) -> Result<Deployment> {
        self.store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Running;
                d.container_name = Some(outcome.container);
                d.image_name = Some(outcome.image);
                d.last_commit_hash = Some(outcome.commit);
                d.internal_port = Some(outcome.internal_port);
                d.deploy_url = Some(outcome.deploy_url);
                d.message = None;
            })
            .await
    }

    /// Clone, inspect, ship, build and run. The local scratch tree is removed
    /// afterwards whatever happened.
    async fn rebuild(&self, deployment: &Deployment, target: &HostTarget) -> Result<BuildOutcome> {
        let scratch = self.settings.work_dir.join(deployment.id.to_string());
        let result = self.rebuild_in(deployment, target, &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %scratch.display(), error = %e, "failed to remove local work dir");
            }
        }
        result
    }

    async fn rebuild_in(
        &self,
        deployment: &Deployment,
        target: &HostTarget,
        scratch: &Path,
    ) -> Result<BuildOutcome> {
        let id = deployment.id;
        // The remote copy keeps the directory name.
        let local = scratch.join(sanitize_name(&deployment.project_name));
        if tokio::fs::try_exists(&local).await? {
            tokio::fs::remove_dir_all(&local).await?;
        }
        tokio::fs::create_dir_all(scratch).await?;

        // Clone
        self.progress(id, "Cloning repository").await;
        self.source.clone_repo(&deployment.git_url, &local).await?;
        let commit = self.source.head_commit(&local).await?;

        // Inspect
        self.progress(id, "Analyzing project").await;
        let descriptor = descriptor_loader::load(&local)?;
        let manifest = ProjectManifest::read(&local)?;
        manifest.require_runnable()?;
        let detection = port_detector::detect_with_source(&local);
        // An explicit `app.port` in deploy.yml wins over source detection.
        let internal_port = descriptor.app.port.unwrap_or(detection.port);
        let framework = port_detector::detect_framework(&local).unwrap_or("Node.js");
        info!(
            deployment_id = %id,
            framework,
            internal_port,
            source = ?detection.source,
            "project analyzed"
        );
        ImageSpec::synthesize(&local, &manifest, &descriptor.app, internal_port).write_dockerfile(&local)?;

        // Ship
        self.progress(id, format!("Uploading {framework} project to {}", target.address))
            .await;
        let remote_dir = deployment.remote_work_dir(&self.settings.remote_root);
        let remote_parent = remote_dir
            .rsplit_once('/')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| self.settings.remote_root.clone());
        self.executor
            .run(target, &docker::remove_dir(&remote_dir), CommandClass::Standard)
            .await?;
        self.executor
            .run(target, &docker::make_dir(&remote_parent), CommandClass::Standard)
            .await?;
        self.executor.copy_tree(target, &local, &remote_parent).await?;

        // Build
        let stamp = Utc::now().timestamp_millis();
        let image = deployment.image_name_at(stamp);
        let container = deployment.container_name_at(stamp);
        self.progress(id, "Building image").await;
        self.executor
            .run(target, &docker::build_image(&remote_dir, &image), CommandClass::Build)
            .await
            .map_err(|e| docker::stage_error(PlatformError::Build, e))?;

        // Run
        if let Err(e) = docker::remove_owned_containers(self.executor.as_ref(), target, deployment, None).await {
            warn!(deployment_id = %id, error = %e, "failed to remove previous containers");
        }
        self.progress(id, "Starting container").await;
        self.executor
            .run(
                target,
                &docker::run_container(&container, deployment.port, internal_port, &image),
                CommandClass::Standard,
            )
            .await
            .map_err(|e| docker::stage_error(PlatformError::Runtime, e))?;

        Ok(BuildOutcome {
            container,
            image,
            commit,
            internal_port,
            deploy_url: target.public_url(deployment.port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::models::{DockerHost, Role};
    use crate::testing::{FakeExecutor, FakeSource};

    const DEFAULT_ADDRESS: &str = "docker.local";

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        executor: Arc<FakeExecutor>,
        source: Arc<FakeSource>,
        pipeline: Arc<DeploymentPipeline>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory());
        let executor = Arc::new(FakeExecutor::new());
        let source = Arc::new(FakeSource::new());
        let scheduler = Arc::new(HostScheduler::new(Some(HostTarget::new(
            DEFAULT_ADDRESS,
            "root",
            None,
        ))));
        let settings = PlatformSettings {
            work_dir: dir.path().join("work"),
            port_search_span: 20,
            ..PlatformSettings::default()
        };
        let pipeline = Arc::new(DeploymentPipeline::new(
            Arc::clone(&store),
            executor.clone(),
            source.clone(),
            scheduler,
            settings,
        ));
        Harness {
            _dir: dir,
            store,
            executor,
            source,
            pipeline,
        }
    }

    fn alice() -> Caller {
        Caller {
            user_id: "u-alice".into(),
            username: "alice".into(),
            role: Role::User,
        }
    }

    fn admin() -> Caller {
        Caller {
            user_id: "u-root".into(),
            username: "root".into(),
            role: Role::Admin,
        }
    }

    async fn deployed(h: &Harness) -> Deployment {
        let d = h
            .pipeline
            .create(&alice(), "https://github.com/alice/shop.git", None)
            .await
            .unwrap();
        h.pipeline.wait(d.id).await;
        h.store.deployment(d.id).await.unwrap()
    }

    #[tokio::test]
    async fn create_builds_and_runs_in_background() {
        let h = harness();
        let provisional = h
            .pipeline
            .create(&alice(), "https://github.com/alice/shop.git", None)
            .await
            .unwrap();
        assert_eq!(provisional.status, DeploymentStatus::Building);
        assert_eq!(provisional.port, 8000);
        assert_eq!(provisional.project_name, "shop");

        h.pipeline.wait(provisional.id).await;
        let d = h.store.deployment(provisional.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running, "{:?}", d.message);
        assert_eq!(d.internal_port, Some(5000));
        assert_eq!(d.last_commit_hash.as_deref(), Some(h.source.commit().as_str()));
        assert_eq!(d.deploy_url.as_deref(), Some("http://docker.local:8000"));
        assert!(d.message.is_none());

        let container = d.container_name.clone().unwrap();
        let running = h.executor.container(DEFAULT_ADDRESS, &container).unwrap();
        assert_eq!(running.external_port, 8000);
        assert_eq!(Some(running.image), d.image_name);

        let copies = h.executor.copies();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].1.ends_with("shop"));
        assert_eq!(copies[0].2, "/tmp/deploy/alice");
        assert!(h
            .executor
            .calls()
            .iter()
            .any(|c| c.command.contains("docker build") && c.class == CommandClass::Build));
    }

    #[tokio::test]
    async fn only_network_git_remotes_are_deployable() {
        let h = harness();
        for url in ["--upload-pack=touch /tmp/owned", "file:///etc/shop.git", "https://host/alice/.."] {
            let err = h.pipeline.create(&alice(), url, None).await.unwrap_err();
            assert!(matches!(err, PlatformError::Validation(_)), "{url}: {err}");
        }
        assert!(h.store.deployments().await.is_empty());
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn new_record_is_locked_from_the_moment_it_appears() {
        let h = harness();
        let pipeline = Arc::clone(&h.pipeline);
        let creating = tokio::spawn(async move {
            pipeline
                .create(&alice(), "https://github.com/alice/shop.git", None)
                .await
        });
        loop {
            if let Some(d) = h.store.deployments().await.into_iter().next() {
                if d.status == DeploymentStatus::Building {
                    assert!(h.pipeline.locks.try_acquire(&d.id).is_none());
                }
                break;
            }
            tokio::task::yield_now().await;
        }
        let d = creating.await.unwrap().unwrap();
        h.pipeline.wait(d.id).await;
    }

    #[tokio::test]
    async fn second_create_for_same_project_conflicts() {
        let h = harness();
        let first = deployed(&h).await;
        let err = h
            .pipeline
            .create(&alice(), "https://github.com/alice/shop", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));

        let unchanged = h.store.deployment(first.id).await.unwrap();
        assert_eq!(unchanged.status, DeploymentStatus::Running);
        assert_eq!(unchanged.container_name, first.container_name);
        assert_eq!(unchanged.updated_at, first.updated_at);
        assert_eq!(h.store.deployments().await.len(), 1);
    }

    #[tokio::test]
    async fn project_without_scripts_fails_with_cause() {
        let h = harness();
        h.source.set_file("package.json", r#"{"name":"lib"}"#);
        let d = deployed(&h).await;
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert!(d.message.unwrap().contains("not a valid web project"));
        assert_eq!(h.executor.count_matching("docker build"), 0);
    }

    #[tokio::test]
    async fn build_failure_is_recorded_as_build_error() {
        let h = harness();
        h.executor.fail(
            "docker build",
            RemoteError::CommandFailed {
                exit_code: Some(1),
                stderr: "npm ERR! missing script: build".into(),
            },
        );
        let d = deployed(&h).await;
        assert_eq!(d.status, DeploymentStatus::Failed);
        let cause = d.message.unwrap();
        assert!(cause.starts_with("Deployment failed: image build failed"), "{cause}");
        assert!(h.executor.containers_on(DEFAULT_ADDRESS).is_empty());
    }

    #[tokio::test]
    async fn descriptor_port_overrides_detection() {
        let h = harness();
        h.source.set_file("deploy.yml", "app:\n  port: 4100\n");
        let d = deployed(&h).await;
        assert_eq!(d.internal_port, Some(4100));
        assert_eq!(h.executor.count_matching("-p 8000:4100"), 1);
    }

    #[tokio::test]
    async fn update_without_new_commits_does_no_work() {
        let h = harness();
        let d = deployed(&h).await;
        h.executor.clear_calls();

        let outcome = h.pipeline.update(&alice(), d.id).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::UpToDate(_)));
        let outcome = h.pipeline.update(&alice(), d.id).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::UpToDate(_)));

        assert!(h.executor.commands().is_empty());
        assert_eq!(h.source.clone_count(), 1);
        let after = h.store.deployment(d.id).await.unwrap();
        assert_eq!(after.last_commit_hash, d.last_commit_hash);
        assert_eq!(after.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn update_with_new_commit_rebuilds() {
        let h = harness();
        let d = deployed(&h).await;
        h.source.set_commit("2222222222222222222222222222222222222222");
        h.source
            .set_file("server.js", "const app = require('express')();\napp.listen(5050);\n");

        let outcome = h.pipeline.update(&alice(), d.id).await.unwrap();
        let UpdateOutcome::Updated(updated) = outcome else {
            panic!("expected a rebuild");
        };
        assert_eq!(updated.status, DeploymentStatus::Running);
        assert_eq!(updated.last_commit_hash.as_deref(), Some("2222222222222222222222222222222222222222"));
        assert_eq!(updated.internal_port, Some(5050));
        assert_eq!(updated.port, d.port);
        assert_eq!(h.executor.containers_on(DEFAULT_ADDRESS), vec![updated.container_name.unwrap()]);
        assert_eq!(h.source.clone_count(), 2);
    }

    #[tokio::test]
    async fn stop_then_start_reuses_image() {
        let h = harness();
        let d = deployed(&h).await;

        let stopped = h.pipeline.stop(&alice(), d.id).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);
        assert!(h.executor.containers_on(DEFAULT_ADDRESS).is_empty());

        let err = h.pipeline.stop(&alice(), d.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::InvalidTransition { action: "stop", .. }));

        h.executor.clear_calls();
        let started = h.pipeline.start(&alice(), d.id).await.unwrap();
        assert_eq!(started.status, DeploymentStatus::Running);
        assert_eq!(started.image_name, d.image_name);
        assert_eq!(h.executor.count_matching("docker build"), 0);
        assert_eq!(h.executor.count_matching("-p 8000:5000"), 1);

        let err = h.pipeline.start(&alice(), d.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::InvalidTransition { action: "start", .. }));
    }

    #[tokio::test]
    async fn start_without_image_asks_for_update() {
        let h = harness();
        let d = deployed(&h).await;
        h.pipeline.stop(&alice(), d.id).await.unwrap();
        h.executor
            .run(
                &HostTarget::new(DEFAULT_ADDRESS, "root", None),
                &docker::remove_image(d.image_name.as_deref().unwrap()),
                CommandClass::Standard,
            )
            .await
            .unwrap();

        let err = h.pipeline.start(&alice(), d.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        assert_eq!(
            h.store.deployment(d.id).await.unwrap().status,
            DeploymentStatus::Stopped
        );
    }

    #[tokio::test]
    async fn stop_failure_marks_failed() {
        let h = harness();
        let d = deployed(&h).await;
        h.executor.fail(
            "docker stop",
            RemoteError::ConnectionRefused {
                target: "root@docker.local".into(),
            },
        );
        let err = h.pipeline.stop(&alice(), d.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::Connectivity(_)));
        let d = h.store.deployment(d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert!(d.message.unwrap().starts_with("Stop failed"));
    }

    #[tokio::test]
    async fn operations_on_a_locked_deployment_are_busy() {
        let h = harness();
        let d = deployed(&h).await;
        let _held = h.pipeline.locks.try_acquire(&d.id).unwrap();
        assert!(matches!(
            h.pipeline.stop(&alice(), d.id).await,
            Err(PlatformError::Busy(id)) if id == d.id
        ));
        assert!(matches!(
            h.pipeline.delete(&alice(), d.id).await,
            Err(PlatformError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn other_users_cannot_touch_a_deployment() {
        let h = harness();
        let d = deployed(&h).await;
        let mallory = Caller {
            user_id: "u-mallory".into(),
            username: "mallory".into(),
            role: Role::User,
        };
        assert!(matches!(
            h.pipeline.stop(&mallory, d.id).await,
            Err(PlatformError::Forbidden(_))
        ));
        assert!(h.pipeline.stop(&admin(), d.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_purges_host_and_record() {
        let h = harness();
        let d = deployed(&h).await;
        h.pipeline.delete(&alice(), d.id).await.unwrap();

        assert!(h.executor.containers_on(DEFAULT_ADDRESS).is_empty());
        assert!(h.executor.images_on(DEFAULT_ADDRESS).is_empty());
        assert!(h.executor.count_matching("rm -rf /tmp/deploy/alice/shop") >= 1);
        assert!(matches!(
            h.store.deployment(d.id).await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_leaves_sibling_project_images() {
        let h = harness();
        let shop = deployed(&h).await;
        let front = h
            .pipeline
            .create(&alice(), "https://github.com/alice/shop-front.git", None)
            .await
            .unwrap();
        h.pipeline.wait(front.id).await;
        let front = h.store.deployment(front.id).await.unwrap();
        assert_eq!(front.status, DeploymentStatus::Running, "{:?}", front.message);

        h.pipeline.delete(&alice(), shop.id).await.unwrap();
        let front_image = front.image_name.clone().unwrap();
        assert_eq!(h.executor.images_on(DEFAULT_ADDRESS), vec![front_image]);
        assert!(h
            .executor
            .container(DEFAULT_ADDRESS, front.container_name.as_deref().unwrap())
            .is_some());

        h.pipeline.stop(&alice(), front.id).await.unwrap();
        let started = h.pipeline.start(&alice(), front.id).await.unwrap();
        assert_eq!(started.status, DeploymentStatus::Running);
        assert_eq!(started.image_name, front.image_name);
    }

    #[tokio::test]
    async fn delete_survives_unreachable_host() {
        let h = harness();
        let d = deployed(&h).await;
        h.executor.fail(
            "",
            RemoteError::HostUnreachable {
                target: "root@docker.local".into(),
                reason: "No route to host".into(),
            },
        );
        h.pipeline.delete(&alice(), d.id).await.unwrap();
        assert!(h.store.deployments().await.is_empty());
    }

    #[tokio::test]
    async fn move_rebuilds_on_new_host_and_clears_old_one() {
        let h = harness();
        let x = h
            .store
            .insert_docker_host(DockerHost::new("x".into(), "10.0.0.1".into(), "deploy".into(), None))
            .await
            .unwrap();
        let d = deployed(&h).await;
        assert_eq!(d.host_id, Some(x.id));
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let y = h
            .store
            .insert_docker_host(DockerHost::new("y".into(), "10.0.0.2".into(), "deploy".into(), None))
            .await
            .unwrap();

        let err = h.pipeline.relocate(&alice(), d.id, y.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::Forbidden(_)));

        let moved = h.pipeline.relocate(&admin(), d.id, y.id).await.unwrap();
        assert_eq!(moved.host_id, Some(y.id));
        assert_eq!(moved.status, DeploymentStatus::Running);
        assert_eq!(moved.deploy_url.as_deref(), Some("http://10.0.0.2:8000"));
        assert!(h.executor.containers_on("10.0.0.1").is_empty());
        assert_eq!(h.executor.containers_on("10.0.0.2").len(), 1);

        let again = h.pipeline.relocate(&admin(), d.id, y.id).await.unwrap_err();
        assert!(matches!(again, PlatformError::Validation(_)));
    }

    #[tokio::test]
    async fn move_refuses_busy_port_on_target() {
        let h = harness();
        let d = deployed(&h).await;
        let y = h
            .store
            .insert_docker_host(DockerHost::new("y".into(), "10.0.0.2".into(), "deploy".into(), None))
            .await
            .unwrap();
        h.executor.add_container("10.0.0.2", "someone-else", "nginx", d.port);

        let err = h.pipeline.relocate(&admin(), d.id, y.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::Conflict(_)));
        let unchanged = h.store.deployment(d.id).await.unwrap();
        assert_eq!(unchanged.host_id, None);
        assert_eq!(unchanged.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn failed_move_keeps_new_host_reference() {
        let h = harness();
        let d = deployed(&h).await;
        let y = h
            .store
            .insert_docker_host(DockerHost::new("y".into(), "10.0.0.2".into(), "deploy".into(), None))
            .await
            .unwrap();
        h.executor.fail(
            "docker build",
            RemoteError::CommandFailed {
                exit_code: Some(1),
                stderr: "no space left on device".into(),
            },
        );

        assert!(h.pipeline.relocate(&admin(), d.id, y.id).await.is_err());
        let failed = h.store.deployment(d.id).await.unwrap();
        assert_eq!(failed.host_id, Some(y.id));
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert!(failed.message.unwrap().contains("no space left on device"));
    }
}
