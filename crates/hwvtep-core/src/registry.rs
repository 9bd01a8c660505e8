// ── Connection registry ──
//
// Cluster-facing lifecycle of every device session on this instance:
// connect and replace, ownership election, disconnect handling, desired
// configuration routing, and the retry/cleanup tasks faults leave behind.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hwvtep_api::transport::same_session;
use hwvtep_api::{
    ConnectionInfo, Connector, DatabaseSchema, OperationalStore, OwnershipChange,
    OwnershipEntity, OwnershipService, OwnershipState, TransportClient,
};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::diag::SessionDump;
use crate::error::CoreError;
use crate::model::{ConfigChange, DesiredEntity, EntityKind, ModelKey, NodeId, TransactCommand};
use crate::scheduler::{ReconciliationScheduler, TaskKey};
use crate::session::writer;
use crate::session::{ConnectionSession, Initiation, SessionParams, SessionState, TransportFault};

/// Desired configuration of one node, kept whether or not it is connected.
#[derive(Debug, Clone, Default)]
struct DesiredNode {
    /// Set when the controller dials the device itself.
    address: Option<SocketAddr>,
    entities: BTreeMap<(EntityKind, ModelKey), DesiredEntity>,
}

// ── ConnectionRegistry ──────────────────────────────────────────────

/// Entry point for the embedding application.
///
/// Cheaply cloneable. Every collaborator is injected at construction;
/// call [`start()`](Self::start) to begin listening for ownership changes
/// and transport faults.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Arc<CoreConfig>,
    connector: Arc<dyn Connector>,
    ownership: Arc<dyn OwnershipService>,
    store: Arc<dyn OperationalStore>,
    scheduler: ReconciliationScheduler,

    // The three views of a live session. Entries for one session are
    // added and removed together, under that node's lifecycle lock.
    by_identity: DashMap<ConnectionInfo, ConnectionSession>,
    by_node: DashMap<NodeId, ConnectionSession>,
    by_entity: DashMap<OwnershipEntity, ConnectionSession>,

    desired: DashMap<NodeId, DesiredNode>,
    /// Serializes connect, ownership and disconnect per node. Entries
    /// live only while someone holds or waits on them.
    lifecycle: DashMap<NodeId, Arc<Mutex<()>>>,
    /// Pending ownership changes per node, drained by one worker each.
    ownership_queues: DashMap<NodeId, mpsc::UnboundedSender<OwnershipChange>>,

    faults_tx: mpsc::UnboundedSender<TransportFault>,
    faults_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportFault>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        ownership: Arc<dyn OwnershipService>,
        store: Arc<dyn OperationalStore>,
        scheduler: ReconciliationScheduler,
    ) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RegistryInner {
                config: Arc::new(config),
                connector,
                ownership,
                store,
                scheduler,
                by_identity: DashMap::new(),
                by_node: DashMap::new(),
                by_entity: DashMap::new(),
                desired: DashMap::new(),
                lifecycle: DashMap::new(),
                ownership_queues: DashMap::new(),
                faults_tx,
                faults_rx: parking_lot::Mutex::new(Some(faults_rx)),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.inner.scheduler
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the ownership listener, the fault handler and the periodic
    /// expiry sweep. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let changes = self.inner.ownership.subscribe(&self.inner.config.entity_type);
        tokio::spawn(ownership_task(self.clone(), changes));

        if let Some(faults) = self.inner.faults_rx.lock().take() {
            tokio::spawn(fault_task(self.clone(), faults));
        }

        let weak = self.downgrade();
        self.inner
            .scheduler
            .spawn_periodic(self.inner.config.sweep_interval, move || {
                let registry = Self::upgrade(&weak);
                async move {
                    if let Some(registry) = registry {
                        registry.sweep();
                    }
                }
            });
        info!(entity_type = %self.inner.config.entity_type, "connection registry started");
    }

    /// Close every session and stop background tasks. Candidacies are
    /// withdrawn; operational records are left for the next owner.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        for session in self.sessions() {
            let _guard = self.lock_node(session.node()).await;
            self.detach(&session).await;
        }
        info!("connection registry stopped");
    }

    async fn lock_node(&self, node: &NodeId) -> NodeLock {
        let lock = Arc::clone(&*self.inner.lifecycle.entry(node.clone()).or_default());
        let guard = lock.lock_owned().await;
        NodeLock {
            guard: Some(guard),
            node: node.clone(),
            registry: Arc::clone(&self.inner),
        }
    }

    // ── Connect ──────────────────────────────────────────────────────

    /// A device dialled in. Its node id is derived from its address.
    pub async fn connected(
        &self,
        client: Arc<dyn TransportClient>,
    ) -> Result<ConnectionSession, CoreError> {
        let node = NodeId::for_device(client.connection_info().remote.ip());
        self.attach(node, client, Initiation::Device).await
    }

    /// Dial a device the controller manages.
    pub async fn connect_to(
        &self,
        node: &NodeId,
        address: SocketAddr,
    ) -> Result<ConnectionSession, CoreError> {
        let client = self.inner.connector.connect(address).await.map_err(|e| {
            warn!(node = %node, %address, error = %e, "connect failed");
            CoreError::from(e)
        })?;
        self.attach(node.clone(), client, Initiation::Controller).await
    }

    async fn attach(
        &self,
        node: NodeId,
        client: Arc<dyn TransportClient>,
        initiation: Initiation,
    ) -> Result<ConnectionSession, CoreError> {
        let _guard = self.lock_node(&node).await;
        let info = client.connection_info();

        // At most one live session per device: replace any other handle.
        let mut existing: Vec<ConnectionSession> = Vec::new();
        for found in [
            self.inner.by_identity.get(&info).map(|s| s.clone()),
            self.inner.by_node.get(&node).map(|s| s.clone()),
        ]
        .into_iter()
        .flatten()
        {
            if !existing.iter().any(|s| s.id() == found.id()) {
                existing.push(found);
            }
        }
        for old in existing {
            if same_session(old.client(), &client) {
                debug!(node = %node, remote = %info, "transport already registered");
                return Ok(old);
            }
            info!(node = %node, remote = %info, "replacing existing session");
            self.detach(&old).await;
        }

        let schema = match self.fetch_schema(&client).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!(node = %node, remote = %info, error = %e, "device metadata unavailable, dropping connection");
                client.disconnect().await;
                return Err(e);
            }
        };

        self.inner.scheduler.cancel(&TaskKey::cleanup(&node));
        self.inner.scheduler.cancel(&TaskKey::retry(&node));

        let session = ConnectionSession::start(SessionParams {
            node: node.clone(),
            client,
            schema,
            initiation,
            config: Arc::clone(&self.inner.config),
            store: Arc::clone(&self.inner.store),
            faults: self.inner.faults_tx.clone(),
        });
        self.inner.by_identity.insert(info, session.clone());
        self.inner.by_node.insert(node.clone(), session.clone());
        self.inner
            .by_entity
            .insert(session.entity().clone(), session.clone());

        if let Some(desired) = self.inner.desired.get(&node) {
            for ((kind, key), entity) in &desired.entities {
                session.cache().put_config(*kind, key, entity.clone());
            }
        }
        info!(node = %node, remote = %info, %initiation, "device connected");

        match self.inner.ownership.register_candidate(session.entity()).await {
            Ok(registration) => session.set_candidate(registration),
            Err(e) if e.is_already_registered() => {
                warn!(entity = %session.entity(), "candidate already registered, keeping existing registration");
            }
            Err(e) => warn!(entity = %session.entity(), error = %e, "candidate registration failed"),
        }
        session.advance(SessionState::AwaitingReconciliation);
        self.schedule_ownership_wait(&node);
        Ok(session)
    }

    async fn fetch_schema(
        &self,
        client: &Arc<dyn TransportClient>,
    ) -> Result<DatabaseSchema, CoreError> {
        let database = self.inner.config.database.as_str();
        let timeout = self.inner.config.metadata_timeout;
        let fetch = async {
            let databases = client.get_databases().await?;
            if !databases.iter().any(|db| db == database) {
                return Err(CoreError::MetadataUnavailable {
                    reason: format!("database {database} not served"),
                });
            }
            let schema = client.get_schema(database).await?;
            Ok::<_, CoreError>(schema)
        };
        tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| CoreError::Timeout {
                operation: "metadata fetch",
                timeout,
            })?
    }

    // ── Disconnect ───────────────────────────────────────────────────

    /// The transport to `info` went away.
    pub async fn disconnected(&self, info: &ConnectionInfo) {
        let session = self.inner.by_identity.get(info).map(|s| s.clone());
        match session {
            Some(session) => self.handle_disconnect(&session).await,
            None => debug!(remote = %info, "disconnect for unknown connection"),
        }
    }

    async fn handle_disconnect(&self, session: &ConnectionSession) {
        let node = session.node().clone();
        let _guard = self.lock_node(&node).await;
        if session.is_closed() {
            return;
        }

        let was_owner = session.is_owner();
        self.detach(session).await;
        if was_owner {
            if let Err(e) = writer::delete_node(self.inner.store.as_ref(), &node).await {
                warn!(node = %node, error = %e, "operational cleanup failed");
            }
        }
        info!(node = %node, was_owner, "device disconnected");

        if session.initiation() == Initiation::Controller && self.desired_address(&node).is_some() {
            self.schedule_retry(&node);
        }
    }

    /// Withdraw candidacy, drop the registry entries and close the
    /// session. Caller holds the node's lifecycle lock.
    async fn detach(&self, session: &ConnectionSession) {
        // Candidacy goes first so another instance can take over before
        // any of our state changes.
        if let Some(registration) = session.take_candidate() {
            if let Err(e) = self.inner.ownership.unregister_candidate(registration).await {
                warn!(entity = %session.entity(), error = %e, "candidate unregistration failed");
            }
        }

        let id = session.id();
        self.inner
            .by_identity
            .remove_if(&session.connection_info(), |_, s| s.id() == id);
        self.inner.by_node.remove_if(session.node(), |_, s| s.id() == id);
        self.inner.by_entity.remove_if(session.entity(), |_, s| s.id() == id);
        self.inner
            .scheduler
            .cancel(&TaskKey::ownership_wait(session.node()));
        session.close().await;
    }

    fn schedule_retry(&self, node: &NodeId) -> bool {
        let weak = self.downgrade();
        let target = node.clone();
        self.inner.scheduler.schedule_retry(
            TaskKey::retry(node),
            self.inner.config.retry_interval,
            move || {
                let registry = Self::upgrade(&weak);
                let node = target.clone();
                async move {
                    match registry {
                        Some(registry) => registry.retry_once(&node).await,
                        None => true,
                    }
                }
            },
        )
    }

    /// One reconnect attempt. `true` ends the retry loop.
    async fn retry_once(&self, node: &NodeId) -> bool {
        if self.inner.cancel.is_cancelled() || self.session(node).is_some() {
            return true;
        }
        let Some(address) = self.desired_address(node) else {
            debug!(node = %node, "node no longer configured, retry stopped");
            return true;
        };
        match self.connect_to(node, address).await {
            Ok(_) => true,
            Err(e) => {
                debug!(node = %node, error = %e, "reconnect attempt failed");
                false
            }
        }
    }

    fn desired_address(&self, node: &NodeId) -> Option<SocketAddr> {
        self.inner.desired.get(node).and_then(|d| d.address)
    }

    // ── Ownership ────────────────────────────────────────────────────

    /// Queue a change for its node's worker, starting one if none runs.
    /// Changes for one node apply in order; nodes never wait on each other.
    fn dispatch_ownership(&self, change: OwnershipChange) {
        let node = NodeId::new(change.entity.name.clone());
        match self.inner.ownership_queues.entry(node.clone()) {
            Entry::Occupied(queue) => {
                if queue.get().send(change).is_err() {
                    debug!(node = %node, "ownership worker stopped, change dropped");
                }
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(change);
                slot.insert(tx);
                tokio::spawn(ownership_worker(self.clone(), node, rx));
            }
        }
    }

    async fn on_ownership_change(&self, change: &OwnershipChange) {
        let node = NodeId::new(change.entity.name.clone());
        let _guard = self.lock_node(&node).await;
        let session = self.inner.by_entity.get(&change.entity).map(|s| s.clone());

        if change.is_owner {
            let Some(session) = session else {
                debug!(entity = %change.entity, "ownership of unconnected entity");
                return;
            };
            self.inner.scheduler.cancel(&TaskKey::cleanup(&node));
            self.inner.scheduler.cancel(&TaskKey::ownership_wait(&node));
            if let Err(e) = session.become_owner().await {
                warn!(node = %node, error = %e, "taking ownership failed");
            }
        } else if !change.has_owner {
            self.schedule_cleanup(node);
        } else if change.was_owner {
            error!(
                entity = %change.entity,
                "ownership moved away from a connected instance; not supported, ignoring"
            );
        } else {
            debug!(entity = %change.entity, "another instance owns this device");
        }
    }

    /// Delete `node`'s operational records after the grace window, unless
    /// the device is connected again by then.
    fn schedule_cleanup(&self, node: NodeId) {
        let weak = self.downgrade();
        let key = TaskKey::cleanup(&node);
        let delay = self.inner.config.cleanup_delay;
        self.inner.scheduler.schedule(key, delay, move || async move {
            let Some(registry) = Self::upgrade(&weak) else {
                return;
            };
            if registry.inner.cancel.is_cancelled() {
                return;
            }
            if registry.session(&node).is_some() {
                debug!(node = %node, "device reconnected, cleanup skipped");
                return;
            }
            match writer::delete_node(registry.inner.store.as_ref(), &node).await {
                Ok(()) => info!(node = %node, "orphaned operational records removed"),
                Err(e) => warn!(node = %node, error = %e, "orphan cleanup failed"),
            }
        });
    }

    /// If no ownership decision arrives in time, ask the ownership service
    /// directly.
    fn schedule_ownership_wait(&self, node: &NodeId) {
        let weak = self.downgrade();
        let target = node.clone();
        let delay = self.inner.config.ownership_wait_timeout;
        self.inner
            .scheduler
            .schedule(TaskKey::ownership_wait(node), delay, move || async move {
                if let Some(registry) = Self::upgrade(&weak) {
                    registry.check_ownership(&target).await;
                }
            });
    }

    async fn check_ownership(&self, node: &NodeId) {
        let _guard = self.lock_node(node).await;
        let Some(session) = self.session(node) else {
            return;
        };
        if session.is_owner() {
            return;
        }
        match self.inner.ownership.ownership_state(session.entity()).await {
            Ok(OwnershipState::Owner) => {
                info!(node = %node, "ownership confirmed after wait");
                if let Err(e) = session.become_owner().await {
                    warn!(node = %node, error = %e, "taking ownership failed");
                }
            }
            Ok(OwnershipState::NoOwner) => {
                warn!(node = %node, "no owner elected after wait");
            }
            Ok(state) => debug!(node = %node, ?state, "ownership wait finished"),
            Err(e) => warn!(node = %node, error = %e, "ownership query failed"),
        }
    }

    // ── Desired configuration ────────────────────────────────────────

    /// Apply one desired-configuration change.
    pub async fn apply_config(&self, change: &ConfigChange) -> Result<(), CoreError> {
        match change {
            ConfigChange::NodeUpserted { node, address } => {
                self.inner.desired.entry(node.clone()).or_default().address = *address;
                match address {
                    Some(address) if self.session(node).is_none() => {
                        if let Err(e) = self.connect_to(node, *address).await {
                            debug!(node = %node, error = %e, "initial connect failed, retrying");
                            self.schedule_retry(node);
                        }
                    }
                    Some(_) => {}
                    None => {
                        self.inner.scheduler.cancel(&TaskKey::retry(node));
                    }
                }
                Ok(())
            }
            ConfigChange::NodeRemoved { node } => {
                let removed = self.inner.desired.remove(node).map(|(_, d)| d);
                self.inner.scheduler.cancel(&TaskKey::retry(node));
                let Some(session) = self.session(node) else {
                    return Ok(());
                };
                if session.initiation() == Initiation::Controller {
                    self.handle_disconnect(&session).await;
                    return Ok(());
                }
                // The device keeps its connection; withdraw what we put there.
                for (kind, key) in removed.into_iter().flat_map(|d| d.entities.into_keys()) {
                    session.apply_config(&ConfigChange::EntityRemoved {
                        node: node.clone(),
                        kind,
                        key,
                    })?;
                }
                Ok(())
            }
            ConfigChange::EntityUpserted {
                node,
                kind,
                key,
                entity,
            } => {
                self.inner
                    .desired
                    .entry(node.clone())
                    .or_default()
                    .entities
                    .insert((*kind, key.clone()), entity.clone());
                self.route(node, change)
            }
            ConfigChange::EntityRemoved { node, kind, key } => {
                if let Some(mut desired) = self.inner.desired.get_mut(node) {
                    desired.entities.remove(&(*kind, key.clone()));
                }
                self.route(node, change)
            }
        }
    }

    fn route(&self, node: &NodeId, change: &ConfigChange) -> Result<(), CoreError> {
        match self.session(node) {
            Some(session) => session.apply_config(change),
            None => {
                debug!(node = %node, "device not connected, change kept for later");
                Ok(())
            }
        }
    }

    /// Submit a command to an owned device.
    pub fn transact(&self, node: &NodeId, cmd: TransactCommand) -> Result<(), CoreError> {
        let session = self.session(node).ok_or_else(|| CoreError::SessionClosed {
            node: node.clone(),
        })?;
        if !session.is_owner() {
            return Err(CoreError::NotOwner { node: node.clone() });
        }
        session.transact(cmd)
    }

    // ── Lookup and maintenance ───────────────────────────────────────

    pub fn session(&self, node: &NodeId) -> Option<ConnectionSession> {
        self.inner.by_node.get(node).map(|s| s.clone())
    }

    pub fn session_for(&self, info: &ConnectionInfo) -> Option<ConnectionSession> {
        self.inner.by_identity.get(info).map(|s| s.clone())
    }

    pub fn session_for_entity(&self, entity: &OwnershipEntity) -> Option<ConnectionSession> {
        self.inner.by_entity.get(entity).map(|s| s.clone())
    }

    pub fn sessions(&self) -> Vec<ConnectionSession> {
        self.inner.by_node.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.by_node.is_empty()
    }

    /// Nodes with lifecycle state currently held.
    pub fn tracked_nodes(&self) -> usize {
        self.inner.lifecycle.len()
    }

    /// Diagnostic snapshot of one device.
    pub fn dump(&self, node: &NodeId) -> Option<SessionDump> {
        self.session(node).map(|s| s.dump())
    }

    /// Expire in-transit rows and stale dependency waits on every session.
    pub fn sweep(&self) {
        let now = Instant::now();
        for session in self.sessions() {
            session.sweep(now);
        }
    }
}

// ── Background tasks ────────────────────────────────────────────────

async fn ownership_task(
    registry: ConnectionRegistry,
    mut changes: broadcast::Receiver<OwnershipChange>,
) {
    let cancel = registry.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = changes.recv() => {
                match result {
                    Ok(change) => registry.dispatch_ownership(change),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "ownership listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn fault_task(
    registry: ConnectionRegistry,
    mut faults: mpsc::UnboundedReceiver<TransportFault>,
) {
    let cancel = registry.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            fault = faults.recv() => {
                let Some(fault) = fault else { break };
                let session = registry
                    .session(&fault.node)
                    .filter(|s| s.id() == fault.session_id);
                let Some(session) = session else {
                    debug!(node = %fault.node, "fault for replaced session ignored");
                    continue;
                };
                warn!(node = %fault.node, error = %fault.error, "transport failure");
                let handler = registry.clone();
                tokio::spawn(async move { handler.handle_disconnect(&session).await });
            }
        }
    }
}

/// Applies one node's ownership changes in arrival order, then exits once
/// its queue is drained.
async fn ownership_worker(
    registry: ConnectionRegistry,
    node: NodeId,
    mut changes: mpsc::UnboundedReceiver<OwnershipChange>,
) {
    let cancel = registry.inner.cancel.clone();
    loop {
        let Ok(change) = changes.try_recv() else {
            // Under the map's shard lock no sender can slip a change in
            // between the check and the removal.
            let drained = registry
                .inner
                .ownership_queues
                .remove_if(&node, |_, _| changes.is_empty())
                .is_some();
            if drained {
                break;
            }
            continue;
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                registry.inner.ownership_queues.remove(&node);
                break;
            }
            () = registry.on_ownership_change(&change) => {}
        }
    }
}

// ── NodeLock ────────────────────────────────────────────────────────

/// Held lifecycle lock of one node. On release the node's entry is
/// pruned unless another caller holds or waits on it.
struct NodeLock {
    guard: Option<OwnedMutexGuard<()>>,
    node: NodeId,
    registry: Arc<RegistryInner>,
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry
            .lifecycle
            .remove_if(&self.node, |_, lock| Arc::strong_count(lock) == 1);
    }
}
