use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::RemoteError;
use crate::models::{HostTarget, TimeoutSettings};
use crate::services::transport::{CommandSpec, TransportSelector};

/// Timeout bucket a remote command falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Connection checks and port probes.
    Probe,
    /// Container lifecycle and housekeeping.
    Standard,
    /// Image builds and tree copies.
    Build,
}

/// Runs shell commands on Docker hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through the remote shell and return its stdout.
    async fn run(
        &self,
        target: &HostTarget,
        command: &str,
        class: CommandClass,
    ) -> Result<String, RemoteError>;

    /// Copy `local_dir` recursively into `remote_parent`, keeping its basename.
    async fn copy_tree(
        &self,
        target: &HostTarget,
        local_dir: &Path,
        remote_parent: &str,
    ) -> Result<(), RemoteError>;
}

pub struct SshExecutor {
    transports: TransportSelector,
    timeouts: TimeoutSettings,
}

impl SshExecutor {
    pub fn new(timeouts: TimeoutSettings) -> Self {
        Self {
            transports: TransportSelector::new(),
            timeouts,
        }
    }

    fn limit(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Probe => self.timeouts.probe(),
            CommandClass::Standard => self.timeouts.command(),
            CommandClass::Build => self.timeouts.build(),
        }
    }

    async fn execute(
        &self,
        target: &HostTarget,
        spec: CommandSpec,
        limit: Duration,
    ) -> Result<String, RemoteError> {
        let mut cmd = Command::new(spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RemoteError::Spawn {
            program: spec.program.to_string(),
            reason: e.to_string(),
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            // The tool may exit before reading its prompt answer.
            let _ = stdin.write_all(input.as_bytes()).await;
        }

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RemoteError::Spawn {
                program: spec.program.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(RemoteError::Timeout {
                    target: target.login(),
                    after: limit,
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_failure(
                &target.login(),
                output.status.code(),
                &stderr,
            ));
        }
        if !stderr.trim().is_empty() {
            trace!(login = %target.login(), stderr = %stderr.trim(), "remote stderr");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &HostTarget,
        command: &str,
        class: CommandClass,
    ) -> Result<String, RemoteError> {
        let transport = self.transports.select(target).await?;
        debug!(login = %target.login(), ?class, command, "remote exec");
        let spec = transport.remote_command(target, command);
        self.execute(target, spec, self.limit(class)).await
    }

    async fn copy_tree(
        &self,
        target: &HostTarget,
        local_dir: &Path,
        remote_parent: &str,
    ) -> Result<(), RemoteError> {
        let transport = self.transports.select(target).await?;
        debug!(
            login = %target.login(),
            local = %local_dir.display(),
            remote_parent,
            "copying tree"
        );
        let spec = transport.copy_command(target, local_dir, remote_parent);
        self.execute(target, spec, self.limit(CommandClass::Build))
            .await
            .map(|_| ())
    }
}

/// Map a failed ssh-family invocation onto a [`RemoteError`] by its stderr.
pub fn classify_failure(login: &str, exit_code: Option<i32>, stderr: &str) -> RemoteError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied") || lowered.contains("access denied") {
        RemoteError::PermissionDenied {
            target: login.to_string(),
        }
    } else if lowered.contains("connection refused") {
        RemoteError::ConnectionRefused {
            target: login.to_string(),
        }
    } else if lowered.contains("could not resolve hostname")
        || lowered.contains("name or service not known")
        || lowered.contains("no route to host")
        || lowered.contains("network is unreachable")
        || lowered.contains("connection timed out")
        || lowered.contains("host does not exist")
    {
        RemoteError::HostUnreachable {
            target: login.to_string(),
            reason: first_line(stderr),
        }
    } else {
        RemoteError::CommandFailed {
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Single-quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@%+".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
