//! Shared fixtures: scripted collaborators and a store wired to an in-memory feed.

#![allow(dead_code)]

use async_trait::async_trait;
use hashbrown::HashSet;
use livecall_core::{
    Clock, Error, ManualClock, ProspectRef, RawCallRecord, RawStatus, Result, SyncConfig, Timestamp,
    ViewerId,
};
use livecall_hub::{ChangeEvent, ChangeFeedHub, MemoryTransport};
use livecall_store::{
    CallNotification, NotificationSink, ObserverHandle, PermissionScope, ReconciliationStore,
    ScopeResolver, SnapshotProvider, WorkingSetUpdate,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const RESOURCE: &str = "sales_calls";
pub const VIEWER: &str = "viewer-1";

/// 2023-11-14T22:13:20Z
pub const T0: i64 = 1_700_000_000_000;

/// Snapshot provider returning a settable list of records.
#[derive(Default)]
pub struct MockSnapshot {
    records: Mutex<Vec<RawCallRecord>>,
    failing: AtomicBool,
    held: AtomicBool,
    fetches: AtomicUsize,
}

impl MockSnapshot {
    pub fn set(&self, records: Vec<RawCallRecord>) {
        *self.records.lock() = records;
    }

    pub fn push(&self, record: RawCallRecord) {
        self.records.lock().push(record);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// While held, fetches wait before answering.
    pub fn hold(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Yields until at least `count` fetches have started.
    pub async fn wait_for_fetches(&self, count: usize) {
        while self.fetches() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl SnapshotProvider for MockSnapshot {
    async fn fetch_candidates(&self) -> Result<Vec<RawCallRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        while self.held.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::snapshot_unavailable("connection reset"));
        }
        Ok(self.records.lock().clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverMode {
    Answering,
    Unavailable,
    Expired,
}

/// Scope resolver with a settable scope and per-prospect denials.
pub struct MockResolver {
    scope: Mutex<PermissionScope>,
    mode: Mutex<ResolverMode>,
    denied: Mutex<HashSet<ProspectRef>>,
    pub resolves: AtomicUsize,
    pub authorizations: AtomicUsize,
}

impl Default for MockResolver {
    fn default() -> Self {
        Self {
            scope: Mutex::new(PermissionScope::full()),
            mode: Mutex::new(ResolverMode::Answering),
            denied: Mutex::new(HashSet::new()),
            resolves: AtomicUsize::new(0),
            authorizations: AtomicUsize::new(0),
        }
    }
}

impl MockResolver {
    pub fn set_scope(&self, scope: PermissionScope) {
        *self.scope.lock() = scope;
    }

    pub fn set_mode(&self, mode: ResolverMode) {
        *self.mode.lock() = mode;
    }

    pub fn deny(&self, prospect: &str) {
        self.denied.lock().insert(ProspectRef::new(prospect));
    }

    fn check(&self) -> Result<()> {
        match *self.mode.lock() {
            ResolverMode::Answering => Ok(()),
            ResolverMode::Unavailable => Err(Error::permission_unavailable("permission service down")),
            ResolverMode::Expired => Err(Error::SessionExpired),
        }
    }
}

#[async_trait]
impl ScopeResolver for MockResolver {
    async fn resolve_scope(&self, _viewer: &ViewerId) -> Result<PermissionScope> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.scope.lock().clone())
    }

    async fn authorize(&self, _viewer: &ViewerId, prospect: &ProspectRef) -> Result<bool> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(!self.denied.lock().contains(prospect))
    }
}

/// Sink recording every notification.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<CallNotification>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.call_id.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &CallNotification) -> Result<()> {
        self.sent.lock().push(notification.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::notification("audio device busy"));
        }
        Ok(())
    }
}

/// A store with scripted collaborators, a manual clock and an in-memory feed.
pub struct Harness {
    pub store: ReconciliationStore,
    pub clock: ManualClock,
    pub transport: Arc<MemoryTransport>,
    pub hub: ChangeFeedHub,
    pub snapshot: Arc<MockSnapshot>,
    pub resolver: Arc<MockResolver>,
    pub sink: Arc<RecordingSink>,
    pub updates: Arc<Mutex<Vec<WorkingSetUpdate>>>,
    pub observer: ObserverHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(T0));
        let transport = Arc::new(MemoryTransport::new());
        let hub = ChangeFeedHub::new(config.hub_name.clone(), transport.clone());
        let snapshot = Arc::new(MockSnapshot::default());
        let resolver = Arc::new(MockResolver::default());
        let sink = Arc::new(RecordingSink::default());

        let store = ReconciliationStore::builder(hub.clone(), snapshot.clone(), resolver.clone())
            .config(config)
            .clock(Arc::new(clock.clone()))
            .notifications(sink.clone())
            .build()
            .unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&updates);
        let observer = store.subscribe_to_working_set(move |update| {
            recorded.lock().push(update.clone());
        });

        Self {
            store,
            clock,
            transport,
            hub,
            snapshot,
            resolver,
            sink,
            updates,
            observer,
        }
    }

    pub async fn start(&self) {
        self.store.initialize(VIEWER, "admin").await.unwrap();
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    /// An ACTIVE record created at the current time.
    pub fn active(&self, id: &str) -> RawCallRecord {
        RawCallRecord::new(id, RawStatus::Active, self.clock.now())
    }

    /// Pushes an event through the in-memory transport and the hub.
    pub fn emit(&self, event: ChangeEvent) -> bool {
        self.transport.emit(RESOURCE, event)
    }

    pub fn emit_update(&self, row: Value) -> bool {
        self.emit(ChangeEvent::update(RESOURCE, row))
    }

    pub fn emit_insert(&self, row: Value) -> bool {
        self.emit(ChangeEvent::insert(RESOURCE, row))
    }

    pub fn emit_delete(&self, row: Value) -> bool {
        self.emit(ChangeEvent::delete(RESOURCE, row))
    }

    /// Visible call IDs, newest first.
    pub fn ids(&self) -> Vec<String> {
        self.store
            .calls()
            .iter()
            .map(|c| c.call_id().to_string())
            .collect()
    }

    pub fn published(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn last_update(&self) -> Option<WorkingSetUpdate> {
        self.updates.lock().last().cloned()
    }
}
