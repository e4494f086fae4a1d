//! Read-only reconciliation of stored deployment status against the
//! containers actually present on each Docker host.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Deployment, DeploymentStatus};
use crate::services::docker;
use crate::services::remote::{CommandClass, RemoteExecutor};
use crate::services::scheduler::HostScheduler;
use crate::services::state::Store;

/// One line of `docker ps -a` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    pub name: String,
    pub status: String,
    pub state: String,
}

pub fn parse_listing(output: &str) -> Vec<ObservedContainer> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(ObservedContainer {
                name: name.to_string(),
                status: parts.next().unwrap_or_default().trim().to_string(),
                state: parts.next().unwrap_or_default().trim().to_ascii_lowercase(),
            })
        })
        .collect()
}

/// Map a container's status line and state onto a deployment status.
pub fn classify(container: &ObservedContainer) -> DeploymentStatus {
    let status = container.status.as_str();
    if status.starts_with("Up ") {
        DeploymentStatus::Running
    } else if status.starts_with("Exited (0)") {
        DeploymentStatus::Stopped
    } else if status.starts_with("Exited") {
        DeploymentStatus::Error
    } else {
        match container.state.as_str() {
            "created" | "restarting" => DeploymentStatus::Building,
            _ => DeploymentStatus::Error,
        }
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    /// Deployments left untouched because their host could not be queried.
    pub unreachable: usize,
}

pub struct StateReconciler {
    store: Arc<Store>,
    executor: Arc<dyn RemoteExecutor>,
    scheduler: Arc<HostScheduler>,
}

impl StateReconciler {
    pub fn new(store: Arc<Store>, executor: Arc<dyn RemoteExecutor>, scheduler: Arc<HostScheduler>) -> Self {
        Self {
            store,
            executor,
            scheduler,
        }
    }

    /// Correct the stored status of `deployments` from what their hosts
    /// report. Each host is queried once. Deployments that are building or
    /// failed are skipped.
    pub async fn reconcile(&self, deployments: &[Deployment]) -> ReconcileReport {
        let mut by_host: HashMap<Option<Uuid>, Vec<&Deployment>> = HashMap::new();
        for deployment in deployments.iter().filter(|d| d.status.is_reconcilable()) {
            by_host.entry(deployment.host_id).or_default().push(deployment);
        }

        let mut report = ReconcileReport::default();
        for group in by_host.values() {
            let Some(first) = group.first() else { continue };
            let listing = match self.scheduler.target_for(&self.store, first).await {
                Ok(target) => self
                    .executor
                    .run(&target, docker::LIST_ALL_WITH_STATUS, CommandClass::Probe)
                    .await
                    .map(|out| parse_listing(&out))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let containers = match listing {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(host_id = ?first.host_id, error = %e, "cannot query host; keeping stored statuses");
                    report.unreachable += group.len();
                    continue;
                }
            };

            for deployment in group {
                report.checked += 1;
                if self.correct(deployment, &containers).await {
                    report.corrected += 1;
                }
            }
        }
        if report.corrected > 0 {
            info!(
                checked = report.checked,
                corrected = report.corrected,
                "reconciled deployment statuses"
            );
        }
        report
    }

    async fn correct(&self, deployment: &Deployment, containers: &[ObservedContainer]) -> bool {
        let stored_name = deployment.container_name.as_deref();
        let found = containers
            .iter()
            .find(|c| Some(c.name.as_str()) == stored_name)
            .or_else(|| {
                containers
                    .iter()
                    .filter(|c| deployment.owns_container(&c.name))
                    .max_by(|a, b| a.name.cmp(&b.name))
            });

        let observed = found.map(classify).unwrap_or(DeploymentStatus::NotFound);
        let adopted = found
            .map(|c| c.name.clone())
            .filter(|name| Some(name.as_str()) != stored_name);
        if observed == deployment.status && adopted.is_none() {
            return false;
        }

        let expected = deployment.status;
        let result = self
            .store
            .update_deployment(deployment.id, |d| {
                // An operation may have moved the record on since it was read.
                if d.status != expected {
                    return;
                }
                d.status = observed;
                if let Some(name) = adopted {
                    d.container_name = Some(name);
                }
            })
            .await;
        match result {
            Ok(_) => {
                debug!(
                    deployment_id = %deployment.id,
                    from = %expected,
                    to = %observed,
                    "status corrected"
                );
                true
            }
            Err(e) => {
                warn!(deployment_id = %deployment.id, error = %e, "could not persist observed status");
                false
            }
        }
    }
}
