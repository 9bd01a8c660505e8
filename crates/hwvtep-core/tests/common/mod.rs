// Shared fakes for the integration tests: an in-memory hardware_vtep
// device, a connector that hands them out, a scripted ownership service
// and a `MemoryStore` wrapper whose commits can be made to fail.

#![allow(clippy::unwrap_used, dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hwvtep_api::wire::{uuid_ref, uuid_value};
use hwvtep_api::{
    CandidateRegistration, ConnectionInfo, Connector, DatabaseSchema, Error, MemoryStore,
    MonitorCallback, MonitorRequest, Operation, OperationResult, OperationalStore,
    OwnershipChange, OwnershipEntity, OwnershipService, OwnershipState, Row, RowUpdate, StorePath,
    StoreTransaction, TableSchema, TableUpdate, TableUpdates, TransportClient,
};
use hwvtep_core::{ConnectionRegistry, CoreConfig, EntityKind, ReconciliationScheduler};
use parking_lot::Mutex;
use serde_json::Value;
use strum::IntoEnumIterator;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── Tracing ─────────────────────────────────────────────────────────

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_test_writer()
        .try_init();
}

// ── Fake device ─────────────────────────────────────────────────────

/// Full hardware_vtep schema as far as the engine monitors it.
pub fn vtep_schema() -> DatabaseSchema {
    let tables = EntityKind::iter()
        .map(|kind| {
            let columns: BTreeSet<String> =
                kind.columns().iter().map(|c| (*c).to_owned()).collect();
            (kind.table().to_owned(), TableSchema { columns })
        })
        .collect();
    DatabaseSchema {
        name: "hardware_vtep".into(),
        version: "1.7.0".into(),
        tables,
    }
}

#[derive(Default)]
struct DeviceState {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
    callback: Option<Arc<dyn MonitorCallback>>,
    transactions: Vec<Vec<Operation>>,
    reject_next: Option<String>,
    drop_next: bool,
    garble_next: bool,
}

/// In-memory device. Transactions are applied to its tables and echoed
/// back through the monitor callback, like a real server would.
pub struct FakeDevice {
    info: ConnectionInfo,
    databases: Vec<String>,
    schema: DatabaseSchema,
    state: Mutex<DeviceState>,
    hang_metadata: bool,
    hang_monitor: AtomicBool,
    fail_monitor: AtomicBool,
    active: AtomicBool,
    disconnects: AtomicUsize,
}

impl FakeDevice {
    pub fn new(remote: &str) -> Arc<Self> {
        Self::build(remote.parse().unwrap(), vec!["hardware_vtep".into()], false)
    }

    pub fn at(remote: SocketAddr) -> Arc<Self> {
        Self::build(remote, vec!["hardware_vtep".into()], false)
    }

    /// Serves only an unrelated database.
    pub fn without_vtep(remote: &str) -> Arc<Self> {
        Self::build(remote.parse().unwrap(), vec!["Open_vSwitch".into()], false)
    }

    /// Never answers metadata requests.
    pub fn unresponsive(remote: &str) -> Arc<Self> {
        Self::build(remote.parse().unwrap(), vec!["hardware_vtep".into()], true)
    }

    fn build(remote: SocketAddr, databases: Vec<String>, hang_metadata: bool) -> Arc<Self> {
        Arc::new(Self {
            info: ConnectionInfo::new(remote),
            databases,
            schema: vtep_schema(),
            state: Mutex::new(DeviceState::default()),
            hang_metadata,
            hang_monitor: AtomicBool::new(false),
            fail_monitor: AtomicBool::new(false),
            active: AtomicBool::new(true),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn client(self: &Arc<Self>) -> Arc<dyn TransportClient> {
        Arc::clone(self) as Arc<dyn TransportClient>
    }

    /// Put a row on the device before anyone monitors it.
    pub fn seed(&self, table: &str, uuid: &str, row: Value) {
        let row = row.as_object().unwrap().clone();
        self.state
            .lock()
            .tables
            .entry(table.to_owned())
            .or_default()
            .insert(uuid.to_owned(), row);
    }

    /// Change made on the device itself (e.g. by its own CLI).
    pub fn device_update(&self, table: &str, uuid: &str, new: Option<Value>) {
        let mut updates = TableUpdates::default();
        {
            let mut state = self.state.lock();
            let rows = state.tables.entry(table.to_owned()).or_default();
            let old = rows.get(uuid).cloned();
            let new = new.map(|v| v.as_object().unwrap().clone());
            match &new {
                Some(row) => {
                    rows.insert(uuid.to_owned(), row.clone());
                }
                None => {
                    rows.remove(uuid);
                }
            }
            let mut table_update = TableUpdate::default();
            table_update
                .rows
                .insert(uuid.to_owned(), RowUpdate { old, new });
            updates.tables.insert(table.to_owned(), table_update);
        }
        self.push(updates);
    }

    /// Simulate the connection dropping under the session.
    pub fn kill(&self) {
        self.active.store(false, Ordering::SeqCst);
        let callback = self.state.lock().callback.clone();
        if let Some(callback) = callback {
            callback.exception(Error::Disconnected);
        }
    }

    pub fn reject_next(&self, message: &str) {
        self.state.lock().reject_next = Some(message.to_owned());
    }

    pub fn drop_next(&self) {
        self.state.lock().drop_next = true;
    }

    /// The next transaction is never applied and its reply is unreadable,
    /// so the engine cannot tell what happened.
    pub fn garble_next(&self) {
        self.state.lock().garble_next = true;
    }

    /// `monitor` never returns.
    pub fn hang_monitor(&self) {
        self.hang_monitor.store(true, Ordering::SeqCst);
    }

    /// The next `monitor` fails with a dropped connection.
    pub fn fail_next_monitor(&self) {
        self.fail_monitor.store(true, Ordering::SeqCst);
    }

    pub fn transactions(&self) -> Vec<Vec<Operation>> {
        self.state.lock().transactions.clone()
    }

    pub fn rows(&self, table: &str) -> BTreeMap<String, Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Device uuid of the row whose `column` equals `value`.
    pub fn find(&self, table: &str, column: &str, value: &str) -> Option<String> {
        self.rows(table)
            .into_iter()
            .find(|(_, row)| row.get(column).and_then(Value::as_str) == Some(value))
            .map(|(uuid, _)| uuid)
    }

    pub fn is_monitored(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn push(&self, updates: TableUpdates) {
        let callback = self.state.lock().callback.clone();
        if let Some(callback) = callback {
            callback.update(updates);
        }
    }

    fn apply(state: &mut DeviceState, operations: &[Operation]) -> (Vec<OperationResult>, TableUpdates) {
        let mut named: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(operations.len());
        let mut touched: Vec<(String, String, Option<Row>)> = Vec::new();

        for op in operations {
            match op {
                Operation::Insert {
                    table,
                    row,
                    uuid_name,
                } => {
                    let uuid = Uuid::new_v4().to_string();
                    if let Some(name) = uuid_name {
                        named.insert(name.clone(), uuid.clone());
                    }
                    state
                        .tables
                        .entry(table.clone())
                        .or_default()
                        .insert(uuid.clone(), row.clone());
                    touched.push((table.clone(), uuid.clone(), None));
                    results.push(OperationResult {
                        uuid: Some(uuid_value(&uuid)),
                        ..OperationResult::default()
                    });
                }
                Operation::Update {
                    table,
                    conditions,
                    row,
                } => {
                    let uuid = uuid_ref(&conditions[0].2).unwrap().to_owned();
                    let rows = state.tables.entry(table.clone()).or_default();
                    let old = rows.get(&uuid).cloned();
                    if let Some(existing) = rows.get_mut(&uuid) {
                        existing.extend(row.clone());
                    }
                    touched.push((table.clone(), uuid, old));
                    results.push(OperationResult {
                        count: Some(1),
                        ..OperationResult::default()
                    });
                }
                Operation::Delete { table, conditions } => {
                    let uuid = uuid_ref(&conditions[0].2).unwrap().to_owned();
                    let old = state.tables.entry(table.clone()).or_default().remove(&uuid);
                    touched.push((table.clone(), uuid, old));
                    results.push(OperationResult {
                        count: Some(1),
                        ..OperationResult::default()
                    });
                }
            }
        }

        let mut updates = TableUpdates::default();
        for (table, uuid, old) in touched {
            let rows = state.tables.entry(table.clone()).or_default();
            if let Some(row) = rows.get_mut(&uuid) {
                for value in row.values_mut() {
                    resolve_named(value, &named);
                }
            }
            let new = rows.get(&uuid).cloned();
            updates
                .tables
                .entry(table)
                .or_default()
                .rows
                .insert(uuid, RowUpdate { old, new });
        }
        (results, updates)
    }
}

fn resolve_named(value: &mut Value, named: &HashMap<String, String>) {
    if let Some(items) = value.as_array_mut() {
        if items.len() == 2 && items[0].as_str() == Some("named-uuid") {
            if let Some(uuid) = items[1].as_str().and_then(|n| named.get(n)) {
                *value = uuid_value(uuid);
            }
            return;
        }
        for item in items {
            resolve_named(item, named);
        }
    }
}

#[async_trait]
impl TransportClient for FakeDevice {
    fn connection_info(&self) -> ConnectionInfo {
        self.info
    }

    async fn get_databases(&self) -> Result<Vec<String>, Error> {
        if self.hang_metadata {
            std::future::pending::<()>().await;
        }
        Ok(self.databases.clone())
    }

    async fn get_schema(&self, database: &str) -> Result<DatabaseSchema, Error> {
        if self.databases.iter().any(|db| db == database) {
            Ok(self.schema.clone())
        } else {
            Err(Error::DatabaseNotFound(database.to_owned()))
        }
    }

    async fn monitor(
        &self,
        _schema: &DatabaseSchema,
        requests: Vec<MonitorRequest>,
        callback: Arc<dyn MonitorCallback>,
    ) -> Result<TableUpdates, Error> {
        if self.hang_monitor.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_monitor.swap(false, Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let mut state = self.state.lock();
        state.callback = Some(callback);
        let mut snapshot = TableUpdates::default();
        for request in requests {
            let Some(rows) = state.tables.get(&request.table) else {
                continue;
            };
            let table = snapshot.tables.entry(request.table.clone()).or_default();
            for (uuid, row) in rows {
                table.rows.insert(
                    uuid.clone(),
                    RowUpdate {
                        old: None,
                        new: Some(row.clone()),
                    },
                );
            }
        }
        Ok(snapshot)
    }

    async fn transact(
        &self,
        _schema: &DatabaseSchema,
        operations: Vec<Operation>,
    ) -> Result<Vec<OperationResult>, Error> {
        let (results, updates) = {
            let mut state = self.state.lock();
            state.transactions.push(operations.clone());
            if std::mem::take(&mut state.drop_next) {
                return Err(Error::Disconnected);
            }
            if std::mem::take(&mut state.garble_next) {
                return Err(Error::Deserialization {
                    message: "truncated reply".into(),
                });
            }
            if let Some(message) = state.reject_next.take() {
                let mut results = vec![OperationResult::default(); operations.len()];
                results[0].error = Some(message);
                return Ok(results);
            }
            Self::apply(&mut state, &operations)
        };
        self.push(updates);
        Ok(results)
    }

    async fn disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

// ── Fake connector ──────────────────────────────────────────────────

/// Hands out a fresh device per dial, or refuses while `refusing`.
#[derive(Default)]
pub struct FakeConnector {
    refusing: AtomicBool,
    fail_monitor: AtomicBool,
    attempts: AtomicUsize,
    dialled: Mutex<Vec<Arc<FakeDevice>>>,
}

impl FakeConnector {
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// The next dialled device fails its first `monitor`.
    pub fn fail_monitor_once(&self) {
        self.fail_monitor.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Arc<FakeDevice>> {
        self.dialled.lock().last().cloned()
    }

    pub fn dialled(&self) -> usize {
        self.dialled.lock().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn TransportClient>, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRefused {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        let device = FakeDevice::at(address);
        if self.fail_monitor.swap(false, Ordering::SeqCst) {
            device.fail_next_monitor();
        }
        self.dialled.lock().push(Arc::clone(&device));
        Ok(device.client())
    }
}

// ── Fake ownership service ──────────────────────────────────────────

/// Single-instance ownership: with `auto_own` every candidate is granted
/// ownership as soon as it registers.
pub struct FakeOwnership {
    auto_own: AtomicBool,
    changes: broadcast::Sender<OwnershipChange>,
    candidates: Mutex<BTreeSet<OwnershipEntity>>,
    states: Mutex<HashMap<OwnershipEntity, OwnershipState>>,
    unregistered: Mutex<Vec<OwnershipEntity>>,
}

impl FakeOwnership {
    pub fn new(auto_own: bool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            auto_own: AtomicBool::new(auto_own),
            changes,
            candidates: Mutex::new(BTreeSet::new()),
            states: Mutex::new(HashMap::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    pub fn announce(&self, change: OwnershipChange) {
        let _ = self.changes.send(change);
    }

    pub fn grant(&self, entity: &OwnershipEntity) {
        self.states
            .lock()
            .insert(entity.clone(), OwnershipState::Owner);
        self.announce(OwnershipChange {
            entity: entity.clone(),
            was_owner: false,
            is_owner: true,
            has_owner: true,
        });
    }

    pub fn set_state(&self, entity: &OwnershipEntity, state: OwnershipState) {
        self.states.lock().insert(entity.clone(), state);
    }

    pub fn is_candidate(&self, entity: &OwnershipEntity) -> bool {
        self.candidates.lock().contains(entity)
    }

    pub fn unregistered(&self) -> Vec<OwnershipEntity> {
        self.unregistered.lock().clone()
    }
}

#[async_trait]
impl OwnershipService for FakeOwnership {
    async fn register_candidate(
        &self,
        entity: &OwnershipEntity,
    ) -> Result<CandidateRegistration, Error> {
        if !self.candidates.lock().insert(entity.clone()) {
            return Err(Error::CandidateAlreadyRegistered {
                entity: entity.to_string(),
            });
        }
        if self.auto_own.load(Ordering::SeqCst) {
            self.grant(entity);
        }
        Ok(CandidateRegistration::new(entity.clone()))
    }

    async fn unregister_candidate(&self, registration: CandidateRegistration) -> Result<(), Error> {
        let entity = registration.entity().clone();
        self.candidates.lock().remove(&entity);
        self.unregistered.lock().push(entity.clone());
        let was_owner = self.states.lock().remove(&entity) == Some(OwnershipState::Owner);
        self.announce(OwnershipChange {
            entity,
            was_owner,
            is_owner: false,
            has_owner: false,
        });
        Ok(())
    }

    async fn ownership_state(&self, entity: &OwnershipEntity) -> Result<OwnershipState, Error> {
        Ok(self
            .states
            .lock()
            .get(entity)
            .copied()
            .unwrap_or(OwnershipState::Unknown))
    }

    fn subscribe(&self, _entity_type: &str) -> broadcast::Receiver<OwnershipChange> {
        self.changes.subscribe()
    }
}

// ── Flaky store ─────────────────────────────────────────────────────

/// `MemoryStore` whose next commits can be made to fail. A failed commit
/// applies nothing.
pub struct FlakyStore {
    inner: MemoryStore,
    failures: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationalStore for FlakyStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, Error> {
        self.inner.read(path).await
    }

    fn begin(&self) -> Box<dyn StoreTransaction> {
        Box::new(FlakyTransaction {
            inner: self.inner.begin(),
            failures: Arc::clone(&self.failures),
        })
    }
}

struct FlakyTransaction {
    inner: Box<dyn StoreTransaction>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreTransaction for FlakyTransaction {
    fn put(&mut self, path: StorePath, value: Value) {
        self.inner.put(path, value);
    }

    fn merge(&mut self, path: StorePath, value: Value) {
        self.inner.merge(path, value);
    }

    fn delete(&mut self, path: StorePath) {
        self.inner.delete(path);
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let Self { inner, failures } = *self;
        let fail = failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            inner.cancel();
            return Err(Error::Store("injected commit failure".into()));
        }
        inner.commit().await
    }

    fn cancel(self: Box<Self>) {
        self.inner.cancel();
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub registry: ConnectionRegistry,
    pub connector: Arc<FakeConnector>,
    pub ownership: Arc<FakeOwnership>,
    /// Reads see what the registry committed through `flaky`.
    pub store: MemoryStore,
    pub flaky: Arc<FlakyStore>,
    pub scheduler: ReconciliationScheduler,
}

impl Harness {
    /// Started registry whose candidates are granted ownership at once.
    pub fn new() -> Self {
        Self::with(CoreConfig::default(), true)
    }

    pub fn with(config: CoreConfig, auto_own: bool) -> Self {
        init_tracing();
        let connector = Arc::new(FakeConnector::default());
        let ownership = Arc::new(FakeOwnership::new(auto_own));
        let store = MemoryStore::new();
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let scheduler = ReconciliationScheduler::new();
        let registry = ConnectionRegistry::new(
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&ownership) as Arc<dyn OwnershipService>,
            Arc::clone(&flaky) as Arc<dyn OperationalStore>,
            scheduler.clone(),
        );
        registry.start();
        Self {
            registry,
            connector,
            ownership,
            store,
            flaky,
            scheduler,
        }
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Poll `check` until it holds. Runs on virtual time in paused tests.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll the store until `node`'s subtree has (or lacks) any record.
pub async fn wait_for_records(store: &MemoryStore, node: &str, present: bool) {
    let root = hwvtep_api::StorePath::root(node);
    for _ in 0..200 {
        if store.paths_under(&root).await.is_empty() != present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for records of {node} (present = {present})");
}
