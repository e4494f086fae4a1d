use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{PlatformError, Result};
use crate::models::{HostTarget, PlatformSettings, ProbeFailurePolicy};
use crate::services::remote::{CommandClass, RemoteExecutor};
use crate::services::state::Store;

/// Commands whose non-empty output means something already holds `port`.
/// Missing tools make a probe fail instead of reporting "free".
pub fn probe_commands(port: u16) -> [String; 4] {
    let pattern = format!("':{port}([^0-9]|$)'");
    [
        format!("command -v ss >/dev/null && {{ ss -tuln | grep -E {pattern} || true; }}"),
        format!("command -v netstat >/dev/null && {{ netstat -tuln | grep -E {pattern} || true; }}"),
        format!("command -v lsof >/dev/null && {{ lsof -i :{port} || true; }}"),
        format!("docker ps --filter publish={port} --format '{{{{.Names}}}}'"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Free,
    Busy,
    /// No probe command could run.
    Unknown,
}

/// Finds external ports for new deployments.
///
/// Candidates already recorded by a deployment, or reserved by a concurrent
/// allocation that has not been persisted yet, are skipped without probing.
pub struct PortFinder {
    start: u16,
    span: u16,
    policy: ProbeFailurePolicy,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

/// A port held for one allocation until its deployment record is written.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.port);
    }
}

impl PortFinder {
    pub fn new(settings: &PlatformSettings) -> Self {
        Self {
            start: settings.port_range_start,
            span: settings.port_search_span,
            policy: settings.probe_failure_policy,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_reserve(&self, port: u16) -> Option<PortReservation> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.insert(port).then(|| PortReservation {
            port,
            reserved: Arc::clone(&self.reserved),
        })
    }

    pub async fn allocate(
        &self,
        store: &Store,
        executor: &dyn RemoteExecutor,
        target: &HostTarget,
    ) -> Result<PortReservation> {
        let recorded = store.recorded_ports().await;
        let end = self.start.saturating_add(self.span);
        for port in self.start..end {
            if recorded.contains(&port) {
                continue;
            }
            let Some(reservation) = self.try_reserve(port) else {
                continue;
            };
            match probe(executor, target, port).await {
                ProbeOutcome::Free => {
                    debug!(port, login = %target.login(), "allocated external port");
                    return Ok(reservation);
                }
                ProbeOutcome::Busy => {
                    debug!(port, "port busy on host");
                }
                ProbeOutcome::Unknown => match self.policy {
                    ProbeFailurePolicy::Optimistic => {
                        warn!(
                            port,
                            login = %target.login(),
                            "no port probe could run; accepting port unverified"
                        );
                        return Ok(reservation);
                    }
                    ProbeFailurePolicy::Strict => {
                        return Err(PlatformError::PortAllocation(format!(
                            "cannot verify port {port} on {}: every probe failed",
                            target.login()
                        )));
                    }
                },
            }
        }
        Err(PlatformError::PortAllocation(format!(
            "no available port in {}..{end}",
            self.start
        )))
    }
}

/// Run every probe for `port`; any evidence of occupancy marks it busy.
pub async fn probe(executor: &dyn RemoteExecutor, target: &HostTarget, port: u16) -> ProbeOutcome {
    let mut any_ran = false;
    for command in probe_commands(port) {
        match executor.run(target, &command, CommandClass::Probe).await {
            Ok(output) if !output.trim().is_empty() => return ProbeOutcome::Busy,
            Ok(_) => any_ran = true,
            Err(e) => debug!(port, error = %e, "port probe failed"),
        }
    }
    if any_ran {
        ProbeOutcome::Free
    } else {
        ProbeOutcome::Unknown
    }
}
