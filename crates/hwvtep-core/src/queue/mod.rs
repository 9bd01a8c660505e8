// ── Dependency-ordered job queue ──
//
// Outbound writes whose referenced rows are not yet confirmed on the device
// wait here. Two wait queues: config jobs (controller writes waiting on
// device state) and oper jobs (device rows waiting on other device rows).
// A single dispatcher task rescans on trigger, so a job is handed out at
// most once no matter how many triggers race.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use strum::Display;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::DeviceCache;
use crate::error::CoreError;
use crate::model::{DeviceId, EntityKind, ModelKey};

const FAILURE_CHANNEL_SIZE: usize = 64;

// ── Dependencies ────────────────────────────────────────────────────

/// Which side's data a job is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WaitQueue {
    /// Controller write waiting on rows the device has not confirmed.
    Config,
    /// Device row waiting on another device row.
    Oper,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyTarget {
    Model(ModelKey),
    Device(DeviceId),
}

impl fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model(key) => write!(f, "{key}"),
            Self::Device(id) => write!(f, "uuid {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyCondition {
    /// Confirmed on the device.
    Available,
    /// Not in transit: either confirmed or known absent.
    Settled,
}

/// One unresolved precondition of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub kind: EntityKind,
    pub target: DependencyTarget,
    pub condition: DependencyCondition,
}

impl Dependency {
    pub fn available(kind: EntityKind, key: ModelKey) -> Self {
        Self {
            kind,
            target: DependencyTarget::Model(key),
            condition: DependencyCondition::Available,
        }
    }

    pub fn available_id(kind: EntityKind, id: DeviceId) -> Self {
        Self {
            kind,
            target: DependencyTarget::Device(id),
            condition: DependencyCondition::Available,
        }
    }

    pub fn settled(kind: EntityKind, key: ModelKey) -> Self {
        Self {
            kind,
            target: DependencyTarget::Model(key),
            condition: DependencyCondition::Settled,
        }
    }

    pub fn is_satisfied(&self, cache: &DeviceCache) -> bool {
        let row = match &self.target {
            DependencyTarget::Model(key) => cache.get(self.kind, key),
            DependencyTarget::Device(id) => cache.get_by_id(self.kind, id),
        };
        match self.condition {
            DependencyCondition::Available => row.is_some_and(|r| r.is_available()),
            DependencyCondition::Settled => !row.is_some_and(|r| r.is_in_transit()),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)
    }
}

// ── Jobs ────────────────────────────────────────────────────────────

type JobAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A deferred write and the preconditions it waits on.
pub struct Job {
    label: String,
    queue: WaitQueue,
    dependencies: Vec<Dependency>,
    action: JobAction,
}

impl Job {
    pub fn new<F, Fut>(
        label: impl Into<String>,
        queue: WaitQueue,
        dependencies: Vec<Dependency>,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            label: label.into(),
            queue,
            dependencies,
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn queue(&self) -> WaitQueue {
        self.queue
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn is_ready(&self, cache: &DeviceCache) -> bool {
        self.dependencies.iter().all(|d| d.is_satisfied(cache))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.label)
            .field("queue", &self.queue)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

struct PendingJob {
    id: u64,
    enqueued_at: Instant,
    job: Job,
}

/// A job dropped because its dependencies did not resolve in time.
#[derive(Debug, Clone)]
pub struct DependencyFailure {
    pub job_id: u64,
    pub queue: WaitQueue,
    pub unresolved: Vec<Dependency>,
    pub error: CoreError,
}

enum Dispatch {
    Rescan(WaitQueue),
    Barrier(oneshot::Sender<()>),
}

// ── DependencyQueue ─────────────────────────────────────────────────

/// Per-device queue of writes waiting on unresolved references.
///
/// Cheaply cloneable. Jobs are released by the dispatcher task, in the
/// order they were added, when [`on_config_data_available`] or
/// [`on_oper_data_available`] finds their dependencies satisfied.
///
/// [`on_config_data_available`]: Self::on_config_data_available
/// [`on_oper_data_available`]: Self::on_oper_data_available
#[derive(Clone)]
pub struct DependencyQueue {
    inner: Arc<QueueInner>,
}

/// Both wait queues, under one lock so the capacity check and the push
/// are atomic.
#[derive(Default)]
struct Slots {
    config: VecDeque<PendingJob>,
    oper: VecDeque<PendingJob>,
}

impl Slots {
    fn get_mut(&mut self, queue: WaitQueue) -> &mut VecDeque<PendingJob> {
        match queue {
            WaitQueue::Config => &mut self.config,
            WaitQueue::Oper => &mut self.oper,
        }
    }

    fn get(&self, queue: WaitQueue) -> &VecDeque<PendingJob> {
        match queue {
            WaitQueue::Config => &self.config,
            WaitQueue::Oper => &self.oper,
        }
    }

    fn len(&self) -> usize {
        self.config.len() + self.oper.len()
    }
}

struct QueueInner {
    cache: Arc<DeviceCache>,
    slots: Mutex<Slots>,
    capacity: usize,
    timeout: Duration,
    next_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    failures: broadcast::Sender<DependencyFailure>,
}

impl DependencyQueue {
    /// Create the queue and spawn its dispatcher. The dispatcher stops
    /// when `cancel` fires.
    pub fn new(
        cache: Arc<DeviceCache>,
        capacity: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_SIZE);
        let queue = Self {
            inner: Arc::new(QueueInner {
                cache,
                slots: Mutex::new(Slots::default()),
                capacity,
                timeout,
                next_id: AtomicU64::new(1),
                dispatch_tx,
                failures,
            }),
        };
        tokio::spawn(dispatcher_task(
            Arc::downgrade(&queue.inner),
            dispatch_rx,
            cancel,
        ));
        queue
    }

    /// Enqueue a job. Fails with [`CoreError::QueueFull`] once both wait
    /// queues together hold `capacity` jobs.
    pub fn add_job(&self, job: Job) -> Result<u64, CoreError> {
        let mut slots = self.inner.slots.lock();
        if slots.len() >= self.inner.capacity {
            drop(slots);
            warn!(job = job.label(), capacity = self.inner.capacity, "dependency queue full");
            return Err(CoreError::QueueFull {
                capacity: self.inner.capacity,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            job = job.label(),
            queue = %job.queue(),
            waiting_on = job.dependencies().len(),
            "job deferred"
        );
        let pending = PendingJob {
            id,
            enqueued_at: Instant::now(),
            job,
        };
        slots.get_mut(pending.job.queue).push_back(pending);
        Ok(id)
    }

    /// Drop a waiting job without running it. `false` if it already ran,
    /// expired or never existed.
    pub fn cancel_job(&self, id: u64) -> bool {
        let mut slots = self.inner.slots.lock();
        for queue in [WaitQueue::Config, WaitQueue::Oper] {
            let slot = slots.get_mut(queue);
            if let Some(pos) = slot.iter().position(|p| p.id == id) {
                slot.remove(pos);
                debug!(id, %queue, "job cancelled");
                return true;
            }
        }
        false
    }

    /// Rescan the config queue.
    pub fn on_config_data_available(&self) {
        let _ = self.inner.dispatch_tx.send(Dispatch::Rescan(WaitQueue::Config));
    }

    /// Rescan the oper queue.
    pub fn on_oper_data_available(&self) {
        let _ = self.inner.dispatch_tx.send(Dispatch::Rescan(WaitQueue::Oper));
    }

    /// Resolves once every trigger sent before this call has been handled
    /// and the jobs it released have run.
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.dispatch_tx.send(Dispatch::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drop jobs that waited past the timeout. Returns how many were
    /// dropped.
    pub fn expire_stale(&self, now: Instant) -> usize {
        self.inner.expire(WaitQueue::Config, now) + self.inner.expire(WaitQueue::Oper, now)
    }

    /// Subscribe to dependency-resolution failures.
    pub fn failures(&self) -> broadcast::Receiver<DependencyFailure> {
        self.inner.failures.subscribe()
    }

    pub fn depth(&self, queue: WaitQueue) -> usize {
        self.inner.slots.lock().get(queue).len()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiting job without running it.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        slots.config.clear();
        slots.oper.clear();
    }
}

impl QueueInner {
    /// Remove ready jobs, preserving order among them.
    fn take_ready(&self, queue: WaitQueue) -> Vec<PendingJob> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(queue);
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = slot
            .drain(..)
            .partition(|p| p.job.is_ready(&self.cache));
        *slot = waiting;
        ready.into()
    }

    fn expire(&self, queue: WaitQueue, now: Instant) -> usize {
        let expired: Vec<PendingJob> = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(queue);
            let (expired, waiting): (VecDeque<_>, VecDeque<_>) = slot
                .drain(..)
                .partition(|p| now.saturating_duration_since(p.enqueued_at) >= self.timeout);
            *slot = waiting;
            expired.into()
        };

        for pending in &expired {
            let waited = now.saturating_duration_since(pending.enqueued_at);
            let unresolved: Vec<Dependency> = pending
                .job
                .dependencies
                .iter()
                .filter(|d| !d.is_satisfied(&self.cache))
                .cloned()
                .collect();
            warn!(
                id = pending.id,
                job = pending.job.label(),
                %queue,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                unresolved = ?unresolved.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "dependency wait timed out, job dropped"
            );
            let _ = self.failures.send(DependencyFailure {
                job_id: pending.id,
                queue,
                unresolved,
                error: CoreError::DependencyTimeout {
                    job: pending.job.label().to_owned(),
                    waited,
                },
            });
        }
        expired.len()
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

async fn dispatcher_task(
    inner: std::sync::Weak<QueueInner>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Dispatch::Rescan(queue) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.expire(queue, Instant::now());
                        let ready = inner.take_ready(queue);
                        drop(inner);
                        for pending in ready {
                            debug!(id = pending.id, job = pending.job.label(), %queue, "job released");
                            (pending.job.action)().await;
                        }
                    }
                    Dispatch::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        }
    }
}
