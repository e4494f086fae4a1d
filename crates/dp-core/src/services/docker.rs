//! Docker command lines run on remote hosts, and helpers that drive them
//! through a [`RemoteExecutor`].

use tracing::{debug, warn};

use crate::error::{PlatformError, RemoteError, Result};
use crate::models::{Deployment, HostTarget};
use crate::services::remote::{shell_quote, CommandClass, RemoteExecutor};

pub fn build_image(work_dir: &str, image: &str) -> String {
    format!(
        "cd {} && DOCKER_BUILDKIT=1 docker build --build-arg BUILDKIT_INLINE_CACHE=1 -t {} .",
        shell_quote(work_dir),
        shell_quote(image)
    )
}

pub fn run_container(container: &str, external_port: u16, internal_port: u16, image: &str) -> String {
    format!(
        "docker run -d --restart=unless-stopped --name {} -p {external_port}:{internal_port} {}",
        shell_quote(container),
        shell_quote(image)
    )
}

pub fn stop_container(container: &str) -> String {
    format!("docker stop {} || true", shell_quote(container))
}

pub fn remove_container(container: &str) -> String {
    format!("docker rm {} || true", shell_quote(container))
}

pub fn list_named(prefix: &str) -> String {
    format!(
        "docker ps -a --filter {} --format '{{{{.Names}}}}'",
        shell_quote(&format!("name={prefix}"))
    )
}

/// Every container with its status line and state, `|`-separated.
pub const LIST_ALL_WITH_STATUS: &str = "docker ps -a --format '{{.Names}}|{{.Status}}|{{.State}}'";

pub fn image_exists(image: &str) -> String {
    format!("docker image inspect {} >/dev/null 2>&1 && echo yes || echo no", shell_quote(image))
}

pub fn remove_image(image: &str) -> String {
    format!("docker rmi {} || true", shell_quote(image))
}

/// Remove every tag of exactly `repository`; `alice-shop` leaves
/// `alice-shop-front` alone.
pub fn remove_repository_images(repository: &str) -> String {
    format!(
        "docker images --filter {} -q | xargs -r docker rmi || true",
        shell_quote(&format!("reference={repository}:*"))
    )
}

pub const PRUNE_DANGLING: &str = "docker image prune -f";

pub fn make_dir(dir: &str) -> String {
    format!("mkdir -p {}", shell_quote(dir))
}

pub fn remove_dir(dir: &str) -> String {
    format!("rm -rf {}", shell_quote(dir))
}

/// Stop and remove one container, ignoring "no such container".
pub async fn stop_and_remove(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    container: &str,
) -> std::result::Result<(), RemoteError> {
    executor
        .run(target, &stop_container(container), CommandClass::Standard)
        .await?;
    executor
        .run(target, &remove_container(container), CommandClass::Standard)
        .await?;
    debug!(login = %target.login(), container, "container removed");
    Ok(())
}

/// Containers on the host that belong to `deployment`.
pub async fn owned_containers(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    deployment: &Deployment,
) -> std::result::Result<Vec<String>, RemoteError> {
    let listing = executor
        .run(
            target,
            &list_named(&deployment.naming_prefix()),
            CommandClass::Standard,
        )
        .await?;
    Ok(listing
        .lines()
        .map(str::trim)
        .filter(|name| deployment.owns_container(name))
        .map(str::to_string)
        .collect())
}

/// Remove every container of `deployment` except `keep`.
pub async fn remove_owned_containers(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    deployment: &Deployment,
    keep: Option<&str>,
) -> Result<usize> {
    let mut removed = 0;
    for name in owned_containers(executor, target, deployment).await? {
        if Some(name.as_str()) == keep {
            continue;
        }
        stop_and_remove(executor, target, &name).await?;
        removed += 1;
    }
    Ok(removed)
}

/// Best-effort teardown of everything a deployment left on a host: its
/// containers, its images, dangling layers and the remote work directory.
/// Failures are logged and skipped.
pub async fn purge_deployment(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    deployment: &Deployment,
    remote_root: &str,
) {
    if let Some(container) = &deployment.container_name {
        if let Err(e) = stop_and_remove(executor, target, container).await {
            warn!(deployment_id = %deployment.id, container, error = %e, "failed to remove container");
        }
    }
    if let Err(e) = remove_owned_containers(executor, target, deployment, None).await {
        warn!(deployment_id = %deployment.id, error = %e, "failed to remove leftover containers");
    }

    let mut cleanup = Vec::new();
    if let Some(image) = &deployment.image_name {
        cleanup.push(remove_image(image));
    }
    cleanup.push(remove_repository_images(&deployment.naming_prefix()));
    cleanup.push(PRUNE_DANGLING.to_string());
    cleanup.push(remove_dir(&deployment.remote_work_dir(remote_root)));

    for command in cleanup {
        if let Err(e) = executor.run(target, &command, CommandClass::Standard).await {
            warn!(deployment_id = %deployment.id, command, error = %e, "cleanup step failed");
        }
    }
}

/// Re-tag a remote failure as belonging to a pipeline stage.
pub fn stage_error(stage: fn(String) -> PlatformError, err: RemoteError) -> PlatformError {
    match err {
        RemoteError::CommandFailed { .. } => stage(err.to_string()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_maps_ports_and_restarts() {
        assert_eq!(
            run_container("alice-shop-1700", 8001, 5173, "alice-shop:1700"),
            "docker run -d --restart=unless-stopped --name alice-shop-1700 -p 8001:5173 alice-shop:1700"
        );
    }

    #[test]
    fn listing_filters_by_prefix() {
        assert_eq!(
            list_named("alice-shop"),
            "docker ps -a --filter name=alice-shop --format '{{.Names}}'"
        );
        assert_eq!(
            remove_repository_images("alice-shop"),
            "docker images --filter 'reference=alice-shop:*' -q | xargs -r docker rmi || true"
        );
    }

    #[test]
    fn build_runs_in_work_dir() {
        assert_eq!(
            build_image("/tmp/deploy/alice/shop", "alice-shop:1700"),
            "cd /tmp/deploy/alice/shop && DOCKER_BUILDKIT=1 docker build --build-arg BUILDKIT_INLINE_CACHE=1 -t alice-shop:1700 ."
        );
    }

    #[test]
    fn stage_error_keeps_connectivity_failures() {
        let build = stage_error(
            PlatformError::Build,
            RemoteError::CommandFailed {
                exit_code: Some(1),
                stderr: "npm ERR!".into(),
            },
        );
        assert!(matches!(build, PlatformError::Build(_)));

        let refused = stage_error(
            PlatformError::Build,
            RemoteError::ConnectionRefused {
                target: "deploy@10.0.0.5".into(),
            },
        );
        assert!(matches!(refused, PlatformError::Connectivity(_)));
    }
}
