use tracing::debug;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::models::{Caller, Deployment, DockerHost, HostTarget};
use crate::services::state::Store;

/// Where a new deployment will run.
#[derive(Debug, Clone)]
pub struct Placement {
    /// `None` when the process-level default host was chosen.
    pub host_id: Option<Uuid>,
    pub target: HostTarget,
}

/// Chooses Docker hosts for deployments.
pub struct HostScheduler {
    default_host: Option<HostTarget>,
}

impl HostScheduler {
    pub fn new(default_host: Option<HostTarget>) -> Self {
        Self { default_host }
    }

    pub fn default_host(&self) -> Option<&HostTarget> {
        self.default_host.as_ref()
    }

    /// Admins may pin an active host; everyone else gets the earliest-created
    /// active host, then the process-level default.
    pub async fn place(&self, store: &Store, caller: &Caller, requested: Option<Uuid>) -> Result<Placement> {
        if let (true, Some(host_id)) = (caller.is_admin(), requested) {
            let host = store
                .docker_host(host_id)
                .await
                .ok()
                .filter(|h| h.is_active)
                .ok_or_else(|| {
                    PlatformError::Validation("Selected Docker host not found or inactive".into())
                })?;
            debug!(host = %host.name, "admin pinned docker host");
            return Ok(Placement {
                host_id: Some(host.id),
                target: host.target(),
            });
        }

        if let Some(host) = store.docker_hosts().await.into_iter().find(|h| h.is_active) {
            return Ok(Placement {
                host_id: Some(host.id),
                target: host.target(),
            });
        }

        self.default_host
            .clone()
            .map(|target| Placement {
                host_id: None,
                target,
            })
            .ok_or_else(|| {
                PlatformError::Validation(
                    "no active Docker host is registered and no default host is configured".into(),
                )
            })
    }

    /// Connection details for the host a deployment lives on.
    pub async fn target_for(&self, store: &Store, deployment: &Deployment) -> Result<HostTarget> {
        match deployment.host_id {
            Some(host_id) => Ok(store.docker_host(host_id).await?.target()),
            None => self.default_host.clone().ok_or_else(|| {
                PlatformError::Validation(format!(
                    "deployment {} has no host and no default host is configured",
                    deployment.id
                ))
            }),
        }
    }

    /// The destination of a move must be active and differ from the current host.
    pub async fn validate_move(
        &self,
        store: &Store,
        deployment: &Deployment,
        new_host_id: Uuid,
    ) -> Result<DockerHost> {
        let host = store
            .docker_host(new_host_id)
            .await
            .ok()
            .filter(|h| h.is_active)
            .ok_or_else(|| {
                PlatformError::Validation("Target Docker host not found or inactive".into())
            })?;
        if deployment.host_id == Some(new_host_id) {
            return Err(PlatformError::Validation(
                "Deployment is already on this host".into(),
            ));
        }
        Ok(host)
    }
}
