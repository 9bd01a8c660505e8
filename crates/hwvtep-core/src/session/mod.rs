// ── Per-device connection session ──
//
// One live transport session with one device: its cache, its dependency
// queue, the first-sync gate in front of its submission path and the
// tasks that serialize outbound transactions and inbound updates.

mod desired;
pub mod gate;
pub mod history;
mod reader;
mod transact;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use hwvtep_api::{
    CandidateRegistration, ConnectionInfo, DatabaseSchema, MonitorCallback, MonitorRequest,
    OperationalStore, OwnershipEntity, TableUpdates, TransportClient,
};
use parking_lot::Mutex;
use serde::Serialize;
use strum::{Display, IntoEnumIterator};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::DeviceCache;
use crate::config::CoreConfig;
use crate::diag::SessionDump;
use crate::error::CoreError;
use crate::model::{ConfigChange, DeviceId, EntityKind, ModelKey, NodeId, TransactCommand};
use crate::queue::DependencyQueue;

use self::gate::{GateOutcome, ReconciliationGate};
use self::history::TransactionHistory;

// ── SessionState ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    /// Transport up, not yet a candidate for ownership.
    ConnectedUnregistered,
    /// Candidate registered; waiting for ownership and the first sync.
    AwaitingReconciliation,
    /// First full sync applied.
    Synced,
    Closed,
}

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Initiation {
    /// We dialled the device; reconnects are retried.
    Controller,
    /// The device dialled us; it is expected to come back on its own.
    Device,
}

/// A transport failure the registry must handle.
#[derive(Debug, Clone)]
pub(crate) struct TransportFault {
    pub session_id: Uuid,
    pub node: NodeId,
    pub error: CoreError,
}

pub(crate) enum Inbound {
    /// Initial monitor snapshot; completes the first sync.
    Snapshot(TableUpdates),
    Update(TableUpdates),
    /// A parked device row whose dependency resolved. Dropped unless it is
    /// still the latest thing the device said about that row.
    Replay {
        kind: EntityKind,
        id: DeviceId,
        generation: u64,
        updates: TableUpdates,
    },
    Exception(hwvtep_api::Error),
}

/// A parked device row: the queue job holding it and the generation its
/// replay carries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deferred {
    pub job: u64,
    pub generation: u64,
}

/// Monitor callback handed to the transport. Forwards into the session's
/// inbound task so updates are applied one batch at a time, in order.
struct SessionCallback {
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MonitorCallback for SessionCallback {
    fn update(&self, updates: TableUpdates) {
        let _ = self.inbound.send(Inbound::Update(updates));
    }

    fn exception(&self, error: hwvtep_api::Error) {
        let _ = self.inbound.send(Inbound::Exception(error));
    }
}

pub(crate) struct SessionParams {
    pub node: NodeId,
    pub client: Arc<dyn TransportClient>,
    pub schema: DatabaseSchema,
    pub initiation: Initiation,
    pub config: Arc<CoreConfig>,
    pub store: Arc<dyn OperationalStore>,
    pub faults: mpsc::UnboundedSender<TransportFault>,
}

// ── ConnectionSession ───────────────────────────────────────────────

/// Handle to one device session. Cheaply cloneable.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node)
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    id: Uuid,
    node: NodeId,
    info: ConnectionInfo,
    client: Arc<dyn TransportClient>,
    schema: DatabaseSchema,
    entity: OwnershipEntity,
    initiation: Initiation,
    cache: Arc<DeviceCache>,
    queue: DependencyQueue,
    gate: Arc<ReconciliationGate<TransactCommand>>,
    state: watch::Sender<SessionState>,
    owner: AtomicBool,
    candidate: Mutex<Option<CandidateRegistration>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    store: Arc<dyn OperationalStore>,
    /// Set when a store write failed; the next owned batch rewrites the
    /// node's subtree from the cache.
    store_dirty: AtomicBool,
    faults: mpsc::UnboundedSender<TransportFault>,
    monitor_timeout: Duration,
    deferred: Mutex<HashMap<(EntityKind, DeviceId), Deferred>>,
    defer_seq: AtomicU64,
    controller_history: TransactionHistory,
    device_history: TransactionHistory,
    cancel: CancellationToken,
}

impl ConnectionSession {
    /// Build the session and spawn its submission and inbound tasks.
    pub(crate) fn start(params: SessionParams) -> Self {
        let SessionParams {
            node,
            client,
            schema,
            initiation,
            config,
            store,
            faults,
        } = params;

        let cancel = CancellationToken::new();
        let cache = Arc::new(DeviceCache::new(config.in_transit_expiry));
        let queue = DependencyQueue::new(
            Arc::clone(&cache),
            config.queue_capacity,
            config.dependency_timeout,
            cancel.child_token(),
        );
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::ConnectedUnregistered);
        let entity = OwnershipEntity::new(config.entity_type.clone(), node.as_str());

        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                info: client.connection_info(),
                node,
                client,
                schema,
                entity,
                initiation,
                cache,
                queue,
                gate: ReconciliationGate::new(submit_tx, config.reconciliation_gate_timeout),
                state,
                owner: AtomicBool::new(false),
                candidate: Mutex::new(None),
                inbound_tx,
                store,
                store_dirty: AtomicBool::new(false),
                faults,
                monitor_timeout: config.monitor_timeout,
                deferred: Mutex::new(HashMap::new()),
                defer_seq: AtomicU64::new(0),
                controller_history: TransactionHistory::new(config.history_capacity),
                device_history: TransactionHistory::new(config.history_capacity),
                cancel,
            }),
        };

        tokio::spawn(submission_task(session.clone(), submit_rx));
        tokio::spawn(inbound_task(session.clone(), inbound_rx));
        debug!(node = %session.node(), session = %session.id(), "session started");
        session
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.info
    }

    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.inner.client
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.inner.schema
    }

    pub fn entity(&self) -> &OwnershipEntity {
        &self.inner.entity
    }

    pub fn initiation(&self) -> Initiation {
        self.inner.initiation
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn is_owner(&self) -> bool {
        self.inner.owner.load(Ordering::SeqCst)
    }

    pub fn gate_outcome(&self) -> Option<GateOutcome> {
        self.inner.gate.outcome()
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.inner.cache
    }

    pub fn queue(&self) -> &DependencyQueue {
        &self.inner.queue
    }

    pub fn controller_history(&self) -> &TransactionHistory {
        &self.inner.controller_history
    }

    pub fn device_history(&self) -> &TransactionHistory {
        &self.inner.device_history
    }

    /// Move forward; a closed session stays closed.
    pub(crate) fn advance(&self, next: SessionState) {
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    pub(crate) fn set_candidate(&self, registration: CandidateRegistration) {
        *self.inner.candidate.lock() = Some(registration);
    }

    pub(crate) fn take_candidate(&self) -> Option<CandidateRegistration> {
        self.inner.candidate.lock().take()
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Queue a command for this device. Before the first sync it is held by
    /// the gate; afterwards it goes straight to the submission task.
    /// Commands reach the device in the order they were accepted here.
    pub fn transact(&self, cmd: TransactCommand) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed {
                node: self.inner.node.clone(),
            });
        }
        self.inner
            .gate
            .submit(cmd)
            .map_err(|_| CoreError::SessionClosed {
                node: self.inner.node.clone(),
            })
    }

    /// Record a desired-configuration change for this device and, when this
    /// instance owns it, push it. Node-level changes are the registry's.
    pub fn apply_config(&self, change: &ConfigChange) -> Result<(), CoreError> {
        let result = match change {
            ConfigChange::EntityUpserted {
                kind, key, entity, ..
            } => {
                self.inner.cache.put_config(*kind, key, entity.clone());
                self.push(*kind, key)
            }
            ConfigChange::EntityRemoved { kind, key, .. } => {
                self.inner.cache.remove_config(*kind, key);
                self.push(*kind, key)
            }
            ConfigChange::NodeUpserted { .. } | ConfigChange::NodeRemoved { .. } => Ok(()),
        };
        self.inner.queue.on_oper_data_available();
        result
    }

    fn push(&self, kind: EntityKind, key: &ModelKey) -> Result<(), CoreError> {
        if !self.is_owner() {
            debug!(node = %self.inner.node, %kind, %key, "not owner, config stored only");
            return Ok(());
        }
        desired::reconcile_entity(self, kind, key.clone())
    }

    // ── Ownership ────────────────────────────────────────────────────

    /// Take over the device: record the node, start monitoring, and queue
    /// the initial snapshot. The first sync completes once the snapshot
    /// has been applied. A failure is reported as a transport fault, so the
    /// registry tears the session down and, for dialled devices, retries.
    pub(crate) async fn become_owner(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed {
                node: self.inner.node.clone(),
            });
        }
        if self.inner.owner.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node = %self.inner.node, "ownership acquired, starting monitor");

        let result = self.start_monitor().await;
        if let Err(e) = &result {
            warn!(node = %self.inner.node, error = %e, "initial monitor failed");
            self.report_fault(e.clone());
        }
        result
    }

    async fn start_monitor(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        let mut tx = inner.store.begin();
        writer::write_node(tx.as_mut(), &inner.node, &inner.info, &inner.schema);
        tx.commit().await?;

        let requests = monitor_requests(&inner.schema);
        let callback = Arc::new(SessionCallback {
            inbound: inner.inbound_tx.clone(),
        });
        let timeout = inner.monitor_timeout;
        let snapshot = tokio::time::timeout(
            timeout,
            inner.client.monitor(&inner.schema, requests, callback),
        )
        .await
        .map_err(|_| CoreError::Timeout {
            operation: "monitor",
            timeout,
        })??;
        let _ = inner.inbound_tx.send(Inbound::Snapshot(snapshot));
        Ok(())
    }

    fn on_synced(&self) {
        self.inner.gate.fire(GateOutcome::Synced);
        self.advance(SessionState::Synced);
        info!(node = %self.inner.node, rows = self.inner.cache.len(), "initial sync complete");
        desired::reconcile_all(self);
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Purge expired in-transit rows and dependency waits, and queue a
    /// store resync if an earlier write failed.
    pub fn sweep(&self, now: Instant) {
        if self.is_owner() && self.inner.store_dirty.load(Ordering::SeqCst) {
            let _ = self
                .inner
                .inbound_tx
                .send(Inbound::Update(TableUpdates::default()));
        }
        let purged = self.inner.cache.sweep_expired(now);
        let dropped = self.inner.queue.expire_stale(now);
        if !purged.is_empty() || dropped > 0 {
            debug!(node = %self.inner.node, purged = purged.len(), dropped, "session sweep");
            self.inner.queue.on_config_data_available();
        }
    }

    pub(crate) fn report_fault(&self, error: CoreError) {
        let _ = self.inner.faults.send(TransportFault {
            session_id: self.inner.id,
            node: self.inner.node.clone(),
            error,
        });
    }

    /// Stop tasks, drop observed state and disconnect. Idempotent.
    pub async fn close(&self) {
        let was = self.inner.state.send_replace(SessionState::Closed);
        if was == SessionState::Closed {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.owner.store(false, Ordering::SeqCst);
        self.inner.queue.clear();
        self.inner.deferred.lock().clear();
        self.inner.cache.clear_rows();
        self.inner.client.disconnect().await;
        info!(node = %self.inner.node, session = %self.inner.id, "session closed");
    }

    /// Read-only view for diagnostics.
    pub fn dump(&self) -> SessionDump {
        SessionDump::capture(self)
    }
}

/// Monitor every known table the device serves, restricted to the
/// columns its schema has.
fn monitor_requests(schema: &DatabaseSchema) -> Vec<MonitorRequest> {
    let mut requests = Vec::new();
    for kind in EntityKind::iter() {
        let Some(table) = schema.table(kind.table()) else {
            warn!(table = kind.table(), "table missing from device schema, skipped");
            continue;
        };
        let columns: Vec<String> = kind
            .columns()
            .iter()
            .filter(|column| {
                let present = table.has_column(column);
                if !present {
                    debug!(table = kind.table(), column, "column missing from device schema");
                }
                present
            })
            .map(|column| (*column).to_owned())
            .collect();
        requests.push(MonitorRequest {
            table: kind.table().to_owned(),
            columns,
        });
    }
    requests
}

// ── Background tasks ────────────────────────────────────────────────

/// Sole path to `transact` for this device, which keeps submissions FIFO.
async fn submission_task(session: ConnectionSession, mut rx: mpsc::UnboundedReceiver<TransactCommand>) {
    let cancel = session.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                transact::execute(&session, cmd).await;
            }
        }
    }
}

async fn inbound_task(session: ConnectionSession, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    let cancel = session.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Inbound::Snapshot(updates) => {
                        reader::apply_updates(&session, &updates).await;
                        session.on_synced();
                    }
                    Inbound::Update(updates) => {
                        reader::apply_updates(&session, &updates).await;
                    }
                    Inbound::Replay { kind, id, generation, updates } => {
                        if reader::claim_deferred(&session, kind, &id, generation) {
                            reader::apply_updates(&session, &updates).await;
                        } else {
                            debug!(node = %session.node(), %kind, %id, "superseded replay dropped");
                        }
                    }
                    Inbound::Exception(e) => {
                        warn!(node = %session.node(), error = %e, "transport exception");
                        session.report_fault(e.into());
                    }
                }
            }
        }
    }
}
