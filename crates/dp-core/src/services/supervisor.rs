use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::DeploymentStatus;
use crate::services::state::Store;

/// One async mutex per key, created on demand.
pub struct KeyedLocks<K> {
    locks: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries nobody holds or waits on can go.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Take the lock for `key` if it is free.
    pub fn try_acquire(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Wait for the lock for `key`.
    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }
}

/// Owns the background pipeline tasks so their failures are observed.
///
/// A panicking pipeline marks its deployment `failed` instead of leaving it
/// stuck in `building`.
pub struct TaskSupervisor {
    store: Arc<Store>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl TaskSupervisor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn spawn<F>(&self, deployment_id: Uuid, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(work);
        let store = Arc::clone(&self.store);
        let watcher = tokio::spawn(async move {
            match inner.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let cause = panic_message(e.into_panic());
                    error!(%deployment_id, cause, "pipeline task panicked");
                    let marked = store
                        .update_deployment(deployment_id, |d| {
                            d.status = DeploymentStatus::Failed;
                            d.message = Some(format!("Deployment failed: internal error ({cause})"));
                        })
                        .await;
                    if let Err(e) = marked {
                        warn!(%deployment_id, error = %e, "could not record pipeline panic");
                    }
                }
                Err(_) => warn!(%deployment_id, "pipeline task cancelled"),
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(deployment_id, watcher);
    }

    /// Wait for the background task of one deployment, if any.
    pub async fn wait(&self, deployment_id: Uuid) {
        let handle = self.tasks.lock().await.remove(&deployment_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every background task to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
