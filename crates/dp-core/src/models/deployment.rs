use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Building,
    Running,
    Stopped,
    Failed,
    /// Observed by reconciliation: no container exists for the deployment.
    NotFound,
    /// Observed by reconciliation: the container exited abnormally.
    Error,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Building => "building",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::NotFound => "not_found",
            DeploymentStatus::Error => "error",
        }
    }

    pub fn can_start(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped
                | DeploymentStatus::Failed
                | DeploymentStatus::NotFound
                | DeploymentStatus::Error
        )
    }

    pub fn can_stop(self) -> bool {
        self == DeploymentStatus::Running
    }

    /// Statuses whose external port is considered held.
    pub fn holds_port(self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Building)
    }

    /// Statuses the reconciler is allowed to correct.
    pub fn is_reconcilable(self) -> bool {
        !matches!(self, DeploymentStatus::Building | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub user_id: String,
    pub username: String,
    pub project_name: String,
    pub git_url: String,
    pub status: DeploymentStatus,
    /// Host-facing port, fixed for the life of the deployment.
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_url: Option<String>,
    /// `None` means the process-level default host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<Uuid>,
    /// Human-readable progress while building, or the cause of a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(
        user_id: String,
        username: String,
        project_name: String,
        git_url: String,
        port: u16,
        host_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            username,
            project_name,
            git_url,
            status: DeploymentStatus::Building,
            port,
            internal_port: None,
            container_name: None,
            image_name: None,
            last_commit_hash: None,
            deploy_url: None,
            host_id,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shared prefix of every container and image built for this deployment.
    pub fn naming_prefix(&self) -> String {
        format!(
            "{}-{}",
            sanitize_name(&self.username),
            sanitize_name(&self.project_name)
        )
    }

    pub fn container_name_at(&self, millis: i64) -> String {
        format!("{}-{millis}", self.naming_prefix())
    }

    pub fn image_name_at(&self, millis: i64) -> String {
        format!("{}:{millis}", self.naming_prefix())
    }

    /// Whether `name` is a container created for this deployment, i.e. the
    /// prefix itself or the prefix followed by a timestamp suffix.
    pub fn owns_container(&self, name: &str) -> bool {
        let prefix = self.naming_prefix();
        match name.strip_prefix(&prefix) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('-')
                .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }

    pub fn remote_work_dir(&self, remote_root: &str) -> String {
        format!(
            "{}/{}/{}",
            remote_root.trim_end_matches('/'),
            sanitize_name(&self.username),
            sanitize_name(&self.project_name)
        )
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Derive a project name from the last path segment of a Git URL.
pub fn project_name_from_url(git_url: &str) -> Option<String> {
    let trimmed = git_url.trim().trim_end_matches('/');
    let segment = trimmed.rsplit(['/', ':']).next()?;
    let name = segment.strip_suffix(".git").unwrap_or(segment);
    // `.` and `..` would escape the per-user work directory.
    if name.is_empty() || name.chars().all(|c| c == '.') {
        None
    } else {
        Some(name.to_string())
    }
}

/// Lowercase and replace anything Docker rejects in names with `-`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
