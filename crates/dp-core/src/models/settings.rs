use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// What the free-port search does when no probe command could run on the host.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeFailurePolicy {
    /// Accept the candidate port (only the persisted records were checked).
    #[default]
    Optimistic,
    /// Refuse to allocate until the host can be probed.
    Strict,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Local scratch directory for clones.
    pub work_dir: PathBuf,
    /// Remote directory under which project trees are copied.
    pub remote_root: String,
    pub port_range_start: u16,
    pub port_search_span: u16,
    pub probe_failure_policy: ProbeFailurePolicy,
    pub timeouts: TimeoutSettings,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("temp"),
            remote_root: "/tmp/deploy".to_string(),
            port_range_start: 8000,
            port_search_span: 1000,
            probe_failure_policy: ProbeFailurePolicy::Optimistic,
            timeouts: TimeoutSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub probe_secs: u64,
    pub command_secs: u64,
    pub build_secs: u64,
    pub database_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            probe_secs: 15,
            command_secs: 120,
            build_secs: 300,
            database_secs: 10,
        }
    }
}

impl TimeoutSettings {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn database(&self) -> Duration {
        Duration::from_secs(self.database_secs)
    }
}
