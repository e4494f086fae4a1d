use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Caller, DatabaseInstance, Deployment, HostTarget, PlatformSettings};
use crate::services::git::{GitCli, SourceFetcher};
use crate::services::inventory::Inventory;
use crate::services::pipeline::DeploymentPipeline;
use crate::services::provisioner::DatabaseProvisioner;
use crate::services::reconciler::StateReconciler;
use crate::services::remote::{RemoteExecutor, SshExecutor};
use crate::services::scheduler::HostScheduler;
use crate::services::sql_admin::{DatabaseAdmin, SqlxAdmin};
use crate::services::state::Store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub store_reachable: bool,
    pub uptime_secs: u64,
    pub builds_in_flight: usize,
    pub version: &'static str,
}

/// Everything a request handler needs, built once at startup and shared.
pub struct Platform {
    store: Arc<Store>,
    pipeline: Arc<DeploymentPipeline>,
    reconciler: StateReconciler,
    provisioner: DatabaseProvisioner,
    inventory: Inventory,
    started_at: Instant,
}

impl Platform {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<dyn RemoteExecutor>,
        source: Arc<dyn SourceFetcher>,
        admin: Arc<dyn DatabaseAdmin>,
        default_host: Option<HostTarget>,
        settings: PlatformSettings,
    ) -> Self {
        let scheduler = Arc::new(HostScheduler::new(default_host));
        Self {
            pipeline: Arc::new(DeploymentPipeline::new(
                Arc::clone(&store),
                Arc::clone(&executor),
                source,
                Arc::clone(&scheduler),
                settings,
            )),
            reconciler: StateReconciler::new(Arc::clone(&store), Arc::clone(&executor), scheduler),
            provisioner: DatabaseProvisioner::new(Arc::clone(&store), Arc::clone(&admin)),
            inventory: Inventory::new(Arc::clone(&store), executor, admin),
            store,
            started_at: Instant::now(),
        }
    }

    /// Wire the production collaborators: SSH, the git CLI and sqlx.
    pub async fn connect(
        state_file: &Path,
        default_host: Option<HostTarget>,
        settings: PlatformSettings,
    ) -> Result<Self> {
        let store = Arc::new(Store::open(state_file).await?);
        info!(
            state_file = %state_file.display(),
            deployments = store.deployments().await.len(),
            "state loaded"
        );
        tokio::fs::create_dir_all(&settings.work_dir).await?;
        let timeouts = settings.timeouts.clone();
        Ok(Self::new(
            store,
            Arc::new(SshExecutor::new(timeouts.clone())),
            Arc::new(GitCli::new(timeouts.build())),
            Arc::new(SqlxAdmin::new(timeouts.database())),
            default_host,
            settings,
        ))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<DeploymentPipeline> {
        &self.pipeline
    }

    pub fn provisioner(&self) -> &DatabaseProvisioner {
        &self.provisioner
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    /// The caller's deployments, newest first, optionally reconciled against
    /// their hosts first.
    pub async fn deployments_for(&self, caller: &Caller, check_status: bool) -> Vec<Deployment> {
        let mine = self.store.deployments_for_user(&caller.user_id).await;
        if !check_status {
            return mine;
        }
        self.reconciler.reconcile(&mine).await;
        self.store.deployments_for_user(&caller.user_id).await
    }

    pub async fn deployment_for(&self, caller: &Caller, id: Uuid) -> Result<Deployment> {
        self.pipeline.authorized(caller, id).await
    }

    pub async fn all_deployments(&self, check_status: bool) -> Vec<Deployment> {
        let all = self.store.deployments().await;
        if !check_status {
            return all;
        }
        self.reconciler.reconcile(&all).await;
        self.store.deployments().await
    }

    pub async fn databases_for(&self, caller: &Caller) -> Vec<DatabaseInstance> {
        self.store.instances_for_user(&caller.user_id).await
    }

    pub async fn health(&self) -> HealthReport {
        let store_reachable = self.store.is_healthy().await;
        HealthReport {
            status: if store_reachable { "ok" } else { "degraded" },
            store_reachable,
            uptime_secs: self.started_at.elapsed().as_secs(),
            builds_in_flight: self.pipeline.in_flight().await,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Let background builds finish.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}
