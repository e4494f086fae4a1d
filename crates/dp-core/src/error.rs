use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("host unreachable: {0}")]
    Connectivity(String),

    #[error("no usable remote transport: {0}")]
    ToolUnavailable(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    ResourceInUse(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("container start failed: {0}")]
    Runtime(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("deployment {0} has an operation in progress")]
    Busy(uuid::Uuid),

    #[error("cannot {action} a deployment in status '{status}'")]
    InvalidTransition { action: &'static str, status: String },

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("database provisioning failed: {0}")]
    Provisioning(String),

    #[error("invalid deploy descriptor at {}: {message}", .path.display())]
    InvalidDescriptor { path: PathBuf, message: String },

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Failures surfaced by a remote executor, before they are mapped onto the
/// platform taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("password authentication needs one of: {0}")]
    AuthToolUnavailable(String),

    #[error("permission denied for {target}")]
    PermissionDenied { target: String },

    #[error("connection refused by {target}")]
    ConnectionRefused { target: String },

    #[error("cannot reach {target}: {reason}")]
    HostUnreachable { target: String, reason: String },

    #[error("command on {target} timed out after {}s", .after.as_secs())]
    Timeout { target: String, after: Duration },

    #[error("command exited with {}: {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },
}

impl From<RemoteError> for PlatformError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AuthToolUnavailable(_) => PlatformError::ToolUnavailable(err.to_string()),
            RemoteError::PermissionDenied { .. } => PlatformError::Authentication(err.to_string()),
            RemoteError::ConnectionRefused { .. }
            | RemoteError::HostUnreachable { .. }
            | RemoteError::Timeout { .. } => PlatformError::Connectivity(err.to_string()),
            RemoteError::CommandFailed { .. } | RemoteError::Spawn { .. } => {
                PlatformError::Remote(err.to_string())
            }
        }
    }
}
