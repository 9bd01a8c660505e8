// ── Reconciliation scheduler ──
//
// Delayed, periodic and retry tasks keyed by (task kind, node). At most one
// task per key is pending; scheduling an occupied key is a no-op and
// cancelling a key stops its task before its next run.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TaskKind {
    /// Reconnect a controller-initiated device.
    ConnectionRetry,
    /// Delete a device's operational records after the grace window.
    OperCleanup,
    /// Query ownership directly if no decision has arrived.
    OwnershipWait,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub node: NodeId,
}

impl TaskKey {
    pub fn new(kind: TaskKind, node: NodeId) -> Self {
        Self { kind, node }
    }

    pub fn retry(node: &NodeId) -> Self {
        Self::new(TaskKind::ConnectionRetry, node.clone())
    }

    pub fn cleanup(node: &NodeId) -> Self {
        Self::new(TaskKind::OperCleanup, node.clone())
    }

    pub fn ownership_wait(node: &NodeId) -> Self {
        Self::new(TaskKind::OwnershipWait, node.clone())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.node)
    }
}

struct ScheduledTask {
    id: u64,
    token: CancellationToken,
}

/// Process-wide scheduler, injected into the registry. Cheaply cloneable.
#[derive(Clone)]
pub struct ReconciliationScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tasks: DashMap<TaskKey, ScheduledTask>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for ReconciliationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Claim `key` for a new task. `None` if it is already taken.
    fn claim(&self, key: &TaskKey) -> Option<(u64, CancellationToken)> {
        if self.inner.shutdown.is_cancelled() {
            return None;
        }
        match self.inner.tasks.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(task = %key, "already scheduled");
                None
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let token = self.inner.shutdown.child_token();
                slot.insert(ScheduledTask {
                    id,
                    token: token.clone(),
                });
                Some((id, token))
            }
        }
    }

    /// Run `f` once after `delay`. Returns `false` without scheduling if a
    /// task for `key` is already pending.
    pub fn schedule<F, Fut>(&self, key: TaskKey, delay: Duration, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some((id, token)) = self.claim(&key) else {
            return false;
        };
        debug!(task = %key, delay_ms = millis(delay), "task scheduled");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            // Free the key before running so the task may reschedule it.
            inner.tasks.remove_if(&key, |_, task| task.id == id);
            f().await;
        });
        true
    }

    /// Call `attempt` every `interval` until it returns `true` or the task
    /// is cancelled. The key stays claimed for the whole run, so repeated
    /// requests do not stack up retries.
    pub fn schedule_retry<F, Fut>(&self, key: TaskKey, interval: Duration, attempt: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let Some((id, token)) = self.claim(&key) else {
            return false;
        };
        debug!(task = %key, interval_ms = millis(interval), "retry scheduled");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut round = 0u32;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                round += 1;
                debug!(task = %key, round, "retry attempt");
                if attempt().await {
                    break;
                }
            }
            inner.tasks.remove_if(&key, |_, task| task.id == id);
        });
        true
    }

    /// Run `f` every `period` until shutdown.
    pub fn spawn_periodic<F, Fut>(&self, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => f().await,
                }
            }
        });
    }

    /// Cancel the pending task for `key`. A run already in progress
    /// completes; no further run starts.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        match self.inner.tasks.remove(key) {
            Some((_, task)) => {
                task.token.cancel();
                debug!(task = %key, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.inner.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    /// Cancel everything, including periodic tasks. Nothing can be
    /// scheduled afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.clear();
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
