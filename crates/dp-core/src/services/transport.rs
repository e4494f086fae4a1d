use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RemoteError;
use crate::models::HostTarget;

/// Options shared by every OpenSSH-family invocation: trust-on-first-use host
/// keys and a bounded connect timeout.
const SSH_OPTIONS: [&str; 8] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=10",
];

/// Password-capable tools, in order of preference.
pub const PASSWORD_LADDER: [Transport; 2] = [Transport::SshPass, Transport::Plink];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// OpenSSH with key-based authentication.
    Key,
    /// OpenSSH driven by `sshpass`, password passed through the environment.
    SshPass,
    /// PuTTY `plink` / `pscp`.
    Plink,
}

/// A fully-resolved local process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: &'static str,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, String)>,
    pub stdin: Option<&'static str>,
}

impl Transport {
    /// The local binary that must be present for this transport.
    pub fn tool(self) -> &'static str {
        match self {
            Transport::Key => "ssh",
            Transport::SshPass => "sshpass",
            Transport::Plink => "plink",
        }
    }

    pub fn remote_command(self, target: &HostTarget, command: &str) -> CommandSpec {
        match self {
            Transport::Key => {
                let mut args = ssh_options();
                args.extend(["-o".into(), "BatchMode=yes".into()]);
                args.push(target.login());
                args.push(command.to_string());
                CommandSpec {
                    program: "ssh",
                    args,
                    env: Vec::new(),
                    stdin: None,
                }
            }
            Transport::SshPass => {
                let mut args = vec!["-e".to_string(), "ssh".to_string()];
                args.extend(ssh_options());
                args.push(target.login());
                args.push(command.to_string());
                CommandSpec {
                    program: "sshpass",
                    args,
                    env: vec![("SSHPASS", target.password.clone().unwrap_or_default())],
                    stdin: None,
                }
            }
            Transport::Plink => CommandSpec {
                program: "plink",
                args: vec![
                    "-ssh".into(),
                    "-l".into(),
                    target.user.clone(),
                    "-pw".into(),
                    target.password.clone().unwrap_or_default(),
                    target.address.clone(),
                    command.to_string(),
                ],
                env: Vec::new(),
                // Accept the host key on first contact.
                stdin: Some("y\n"),
            },
        }
    }

    /// Recursively copy `local_dir` into `remote_parent`, keeping its basename.
    pub fn copy_command(self, target: &HostTarget, local_dir: &Path, remote_parent: &str) -> CommandSpec {
        let source = local_dir.to_string_lossy().to_string();
        let destination = format!("{}:{}/", target.login(), remote_parent.trim_end_matches('/'));
        match self {
            Transport::Key => {
                let mut args = ssh_options();
                args.extend(["-o".into(), "BatchMode=yes".into(), "-r".into(), source, destination]);
                CommandSpec {
                    program: "scp",
                    args,
                    env: Vec::new(),
                    stdin: None,
                }
            }
            Transport::SshPass => {
                let mut args = vec!["-e".to_string(), "scp".to_string()];
                args.extend(ssh_options());
                args.extend(["-r".into(), source, destination]);
                CommandSpec {
                    program: "sshpass",
                    args,
                    env: vec![("SSHPASS", target.password.clone().unwrap_or_default())],
                    stdin: None,
                }
            }
            Transport::Plink => CommandSpec {
                program: "pscp",
                args: vec![
                    "-scp".into(),
                    "-pw".into(),
                    target.password.clone().unwrap_or_default(),
                    "-r".into(),
                    source,
                    destination,
                ],
                env: Vec::new(),
                stdin: Some("y\n"),
            },
        }
    }
}

fn ssh_options() -> Vec<String> {
    SSH_OPTIONS.iter().map(|s| s.to_string()).collect()
}

/// Pick the transport for a target: keys when no password is configured,
/// otherwise the first installed tool on the password ladder.
pub fn choose_transport(
    has_password: bool,
    mut installed: impl FnMut(Transport) -> bool,
) -> Result<Transport, RemoteError> {
    if !has_password {
        return Ok(Transport::Key);
    }
    PASSWORD_LADDER
        .into_iter()
        .find(|t| installed(*t))
        .ok_or_else(|| {
            RemoteError::AuthToolUnavailable(
                PASSWORD_LADDER
                    .iter()
                    .map(|t| t.tool())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        })
}

/// Resolves and caches the transport for each target so tools are probed
/// once per host rather than once per command.
#[derive(Default)]
pub struct TransportSelector {
    cache: Mutex<HashMap<String, Transport>>,
}

impl TransportSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn select(&self, target: &HostTarget) -> Result<Transport, RemoteError> {
        let key = format!("{}#{}", target.login(), target.password.is_some());
        if let Some(transport) = self.cache.lock().await.get(&key) {
            return Ok(*transport);
        }

        let mut installed = HashMap::new();
        if target.password.is_some() {
            for transport in PASSWORD_LADDER {
                installed.insert(transport, tool_installed(transport.tool()).await);
            }
        }
        let transport = choose_transport(target.password.is_some(), |t| {
            installed.get(&t).copied().unwrap_or(false)
        })?;

        debug!(login = %target.login(), ?transport, "selected remote transport");
        self.cache.lock().await.insert(key, transport);
        Ok(transport)
    }
}

async fn tool_installed(program: &str) -> bool {
    Command::new(program)
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok()
}
