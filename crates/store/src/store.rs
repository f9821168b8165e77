//! Reconciliation store.
//!
//! `ReconciliationStore` keeps one viewer session's working set of visible
//! ACTIVE calls. It combines two inputs:
//!
//! - **Bulk snapshots**: a full reload fetches every candidate, classifies
//!   it, filters it by the viewer's permission scope and staleness, diffs
//!   the result against the current working set and swaps it in.
//! - **Change events**: tracked calls are merged in place. A tracked call
//!   that stops being ACTIVE is held for a grace period before removal, so a
//!   late correction can bring it back. New ACTIVE calls are never fetched
//!   one by one; they restart a debounce timer that triggers one reload for
//!   the whole burst.
//!
//! All session state sits behind one lock. Observers and the notification
//! sink run after that lock is released, serialized by a publish gate so
//! that versions reach observers in increasing order and nothing is
//! published once [`ReconciliationStore::cleanup`] has returned.
//!
//! Timers do not fire by themselves. Call
//! [`ReconciliationStore::run_due_timers`] (or run
//! [`ReconciliationStore::drive`]) to act on due grace periods and the
//! debounced reload.

use crate::collaborators::{
    CallNotification, NoopNotificationSink, NotificationSink, PermissionScope, ScopeMode,
    ScopeResolver, SnapshotProvider,
};
use crate::observer::{ObserverHandle, ObserverRegistry};
use crate::timer::{TimerKey, TimerQueue};
use crate::transcript::TranscriptEntry;
use crate::working_set::{WorkingSet, WorkingSetDiff, WorkingSetUpdate};
use core::cell::Cell;
use core::fmt;
use core::time::Duration;
use hashbrown::{HashMap, HashSet};
use livecall_core::{
    CallId, CallPatch, ClassifiedCall, Clock, Error, RawCallRecord, Result, SyncConfig,
    SystemClock, Timestamp, ViewerId,
};
use livecall_hub::{ChangeEvent, ChangeFeedHub, EventFilter, EventType, Subscription};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Lifecycle of a viewer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Uninitialized,
    /// The initial reload is running.
    Loading,
    Ready,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Uninitialized => "UNINITIALIZED",
            SessionState::Loading => "LOADING",
            SessionState::Ready => "READY",
            SessionState::TornDown => "TORN_DOWN",
        })
    }
}

/// How a full reload treats fields learned from change events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadMode {
    /// Keep payload fields only change events delivered, and keep tracked
    /// records that are newer than the snapshot.
    Merge,
    /// Take the snapshot as is.
    HardOverwrite,
}

/// Counters of one applied reload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadStats {
    pub candidates: usize,
    pub visible: usize,
    pub added: usize,
    pub removed: usize,
    pub stale: usize,
    pub denied: usize,
    pub notified: usize,
}

/// Result of a full reload request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new working set was swapped in.
    Applied(ReloadStats),
    /// Another reload was in flight; a debounced reload was scheduled instead.
    Deferred,
    /// The session is not running or is disabled.
    Skipped,
    /// The session was torn down while the reload was suspended.
    Cancelled,
    /// The snapshot provider failed; the previous working set is kept.
    SnapshotFailed,
    /// The viewer's authorization session expired; the session was torn down.
    SessionExpired,
}

/// What a change event did to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Not applicable: session not running, disabled, other resource or non-active untracked call.
    Ignored,
    /// The payload could not be read.
    Invalid,
    /// Nothing changed, e.g. a duplicate event.
    Unchanged,
    /// A tracked call was updated in place.
    Merged,
    /// A tracked call left ACTIVE; its removal waits for the grace period.
    RemovalScheduled,
    /// A tracked call came back to ACTIVE before its grace period ran out.
    RemovalCancelled,
    /// A new ACTIVE call (re)started the reload debounce.
    ReloadScheduled,
    /// A call was removed immediately.
    Removed,
}

/// What [`ReconciliationStore::run_due_timers`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimerReport {
    /// Calls removed after their grace period.
    pub removed: Vec<CallId>,
    /// Outcome of the debounced reload, if it was due.
    pub reload: Option<ReloadOutcome>,
}

/// Summary of the change feed the store listens to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDiagnostics {
    pub open_channels: usize,
    pub listener_count: usize,
    pub connected: bool,
}

/// Snapshot of the store's internal counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDiagnostics {
    pub state: SessionState,
    pub enabled: bool,
    pub viewer: Option<ViewerId>,
    pub role: Option<String>,
    pub working_set: usize,
    pub pending_removals: usize,
    pub pending_arrivals: usize,
    pub reload_scheduled: bool,
    pub reload_in_flight: bool,
    pub reloads_started: u64,
    pub reloads_applied: u64,
    pub reloads_deferred: u64,
    pub reloads_failed: u64,
    pub notified: usize,
    pub stale_reported: usize,
    pub version: u64,
    pub feed: FeedDiagnostics,
}

/// A tracked call that left ACTIVE and waits for its grace period.
struct PendingRemoval {
    /// Latest merged record, not ACTIVE
    latest: RawCallRecord,
    /// Payload keys carried by the events merged into `latest`
    keys: HashSet<String>,
}

#[derive(Default)]
struct ReloadControl {
    in_flight: bool,
    /// A trigger arrived while a reload was in flight and owns the debounce timer
    trigger_deferred: bool,
    started: u64,
    applied: u64,
    deferred: u64,
    failed: u64,
}

struct Session {
    lifecycle: SessionState,
    enabled: bool,
    viewer: Option<ViewerId>,
    role: Option<String>,
    /// Scope used by the last applied reload
    scope: Option<PermissionScope>,
    working_set: WorkingSet,
    pending_removals: HashMap<CallId, PendingRemoval>,
    /// New ACTIVE calls waiting for the debounced reload
    pending_arrivals: HashSet<CallId>,
    notified: HashSet<CallId>,
    stale_reported: HashSet<CallId>,
    timers: TimerQueue,
    focused: Option<CallId>,
    transcripts: HashMap<CallId, Vec<TranscriptEntry>>,
    reload: ReloadControl,
    /// Calls removed while a reload was in flight, with the removal time
    removed_during_reload: HashMap<CallId, Timestamp>,
    subscription: Option<Subscription>,
    version: u64,
    /// Bumped on teardown; work started under an older epoch is discarded
    epoch: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            lifecycle: SessionState::Uninitialized,
            enabled: true,
            viewer: None,
            role: None,
            scope: None,
            working_set: WorkingSet::new(),
            pending_removals: HashMap::new(),
            pending_arrivals: HashSet::new(),
            notified: HashSet::new(),
            stale_reported: HashSet::new(),
            timers: TimerQueue::new(),
            focused: None,
            transcripts: HashMap::new(),
            reload: ReloadControl::default(),
            removed_during_reload: HashMap::new(),
            subscription: None,
            version: 0,
            epoch: 0,
        }
    }

    #[inline]
    fn is_running(&self) -> bool {
        matches!(self.lifecycle, SessionState::Loading | SessionState::Ready)
    }

    fn forget_extras(&mut self, id: &CallId) {
        if self.focused.as_ref() == Some(id) {
            self.focused = None;
        }
        self.transcripts.remove(id);
    }

    /// Keeps an in-flight snapshot from bringing back a call removed at `at`.
    fn record_removal(&mut self, id: &CallId, at: Timestamp) {
        if self.reload.in_flight {
            self.removed_during_reload.insert(id.clone(), at);
        }
    }

    /// Removes a call right away, bypassing the grace period.
    fn remove_now(&mut self, id: &CallId, at: Timestamp, diff: &mut WorkingSetDiff) -> bool {
        let mut touched = self.timers.cancel(&TimerKey::Removal(id.clone()));
        touched |= self.pending_removals.remove(id).is_some();
        if self.pending_arrivals.remove(id) {
            touched = true;
            if self.pending_arrivals.is_empty() && !self.reload.trigger_deferred {
                self.timers.cancel(&TimerKey::Reload);
            }
        }
        if self.working_set.remove(id).is_some() {
            diff.removed.push(id.clone());
            self.forget_extras(id);
            touched = true;
        }
        if touched {
            self.record_removal(id, at);
        }
        touched
    }

    /// Drops everything but the enabled flag, the version and the epoch.
    fn clear(&mut self) -> Vec<CallId> {
        let mut removed: Vec<CallId> = self.working_set.ids().cloned().collect();
        removed.sort();
        self.working_set.clear();
        self.pending_removals.clear();
        self.pending_arrivals.clear();
        self.timers.clear();
        self.reload.trigger_deferred = false;
        self.removed_during_reload.clear();
        self.focused = None;
        self.transcripts.clear();
        removed
    }

    fn commit(&mut self, diff: WorkingSetDiff) -> Option<WorkingSetUpdate> {
        if diff.is_empty() {
            return None;
        }
        self.version += 1;
        Some(WorkingSetUpdate::new(self.version, diff, &self.working_set))
    }
}

/// Side effects produced under the session lock, delivered after it.
struct Effects {
    epoch: u64,
    notifications: Vec<CallNotification>,
    update: Option<WorkingSetUpdate>,
}

impl Effects {
    fn new(epoch: u64, update: Option<WorkingSetUpdate>) -> Self {
        Self {
            epoch,
            notifications: Vec::new(),
            update,
        }
    }

    fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.update.is_none()
    }
}

struct StoreInner {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    hub: ChangeFeedHub,
    snapshots: Arc<dyn SnapshotProvider>,
    resolver: Arc<dyn ScopeResolver>,
    sink: Arc<dyn NotificationSink>,
    session: Mutex<Session>,
    observers: ObserverRegistry,
    /// Last version delivered to observers
    publish_gate: ReentrantMutex<Cell<u64>>,
}

/// Clears the in-flight flag when a reload returns, unless the session moved on.
struct InFlight<'a> {
    inner: &'a StoreInner,
    epoch: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut session = self.inner.session.lock();
        if session.epoch == self.epoch {
            session.reload.in_flight = false;
        }
    }
}

impl StoreInner {
    fn is_current(&self, epoch: u64) -> bool {
        let session = self.session.lock();
        session.epoch == epoch && session.is_running()
    }

    fn is_stale(&self, record: &RawCallRecord, now: Timestamp) -> bool {
        if now.duration_since(record.created_at) <= self.config.new_record_grace() {
            return false;
        }
        now.duration_since(record.last_activity()) > self.config.stale_threshold()
    }

    /// Delivers notifications and the working-set update.
    ///
    /// Runs under the publish gate; effects of an older epoch are dropped.
    fn flush(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        let gate = self.publish_gate.lock();
        if self.session.lock().epoch != effects.epoch {
            return;
        }

        for notification in &effects.notifications {
            if let Err(e) = self.sink.notify(notification) {
                debug!(call_id = %notification.call_id, error = %e, "notification failed");
            }
        }

        let Some(update) = effects.update else {
            return;
        };
        if update.version <= gate.get() {
            return;
        }
        gate.set(update.version);

        for (id, observer) in self.observers.snapshot() {
            // An observer re-entered the store and a newer version went out.
            if gate.get() > update.version {
                break;
            }
            // An observer ended the session.
            if self.session.lock().epoch != effects.epoch {
                break;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&update))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "observer panicked".to_string());
                error!(observer = id, version = update.version, panic = %message, "working-set observer panicked");
            }
        }
    }

    fn on_change_event(&self, event: &ChangeEvent) -> EventOutcome {
        if !event.resource.is_empty() && event.resource != self.config.resource {
            return EventOutcome::Ignored;
        }

        let patch = match CallPatch::from_json(&Value::Object(event.row().clone())) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(resource = %event.resource, event_type = %event.event_type, error = %e, "unreadable change event");
                return EventOutcome::Invalid;
            }
        };

        let now = self.clock.now();
        let mut diff = WorkingSetDiff::default();
        let (outcome, effects) = {
            let mut session = self.session.lock();
            if !session.is_running() || !session.enabled {
                return EventOutcome::Ignored;
            }

            let outcome = match event.event_type {
                EventType::Delete => {
                    if session.remove_now(&patch.call_id, now, &mut diff) {
                        EventOutcome::Removed
                    } else {
                        EventOutcome::Ignored
                    }
                }
                EventType::Insert | EventType::Update => {
                    self.apply_upsert(&mut session, &patch, now, &mut diff)
                }
            };
            let epoch = session.epoch;
            (outcome, Effects::new(epoch, session.commit(diff)))
        };

        debug!(call_id = %patch.call_id, event_type = %event.event_type, outcome = ?outcome, "change event applied");
        self.flush(effects);
        outcome
    }

    fn apply_upsert(
        &self,
        session: &mut Session,
        patch: &CallPatch,
        now: Timestamp,
        diff: &mut WorkingSetDiff,
    ) -> EventOutcome {
        let id = &patch.call_id;

        let Some(tracked) = session.working_set.get(id) else {
            if session.pending_arrivals.contains(id) {
                return EventOutcome::Unchanged;
            }
            if !ClassifiedCall::new(patch.to_record()).is_active() {
                return EventOutcome::Ignored;
            }
            session.pending_arrivals.insert(id.clone());
            let at = now.saturating_add(self.config.debounce_reload());
            session.timers.schedule(TimerKey::Reload, at);
            debug!(call_id = %id, at = %at, batched = session.pending_arrivals.len(), "reload debounced");
            return EventOutcome::ReloadScheduled;
        };

        let (mut record, mut keys) = match session.pending_removals.get(id) {
            Some(pending) => (pending.latest.clone(), pending.keys.clone()),
            None => (tracked.record.clone(), HashSet::new()),
        };
        if !patch.apply(&mut record) {
            return EventOutcome::Unchanged;
        }
        keys.extend(patch.payload_keys().map(str::to_string));

        let permitted = session
            .scope
            .as_ref()
            .map_or(true, |scope| scope.permits(record.prospect_ref.as_ref()));
        if !permitted {
            debug!(call_id = %id, "merged call left the viewer's scope");
            session.remove_now(id, now, diff);
            return EventOutcome::Removed;
        }

        let call = ClassifiedCall::new(record);
        let removal = TimerKey::Removal(id.clone());
        if call.is_active() {
            let cancelled = session.timers.cancel(&removal);
            session.pending_removals.remove(id);
            if session
                .working_set
                .merge(call, keys.iter().map(String::as_str))
            {
                diff.modified.push(id.clone());
            }
            if cancelled {
                debug!(call_id = %id, "grace period cancelled");
                EventOutcome::RemovalCancelled
            } else {
                EventOutcome::Merged
            }
        } else {
            let at = now.saturating_add(self.config.grace_period_removal());
            session.timers.schedule(removal, at);
            debug!(call_id = %id, state = %call.state, at = %at, "grace period started");
            session.pending_removals.insert(
                id.clone(),
                PendingRemoval {
                    latest: call.record,
                    keys,
                },
            );
            EventOutcome::RemovalScheduled
        }
    }

    async fn full_reload(&self, mode: ReloadMode) -> ReloadOutcome {
        let (epoch, viewer) = {
            let mut session = self.session.lock();
            if !session.is_running() || !session.enabled {
                return ReloadOutcome::Skipped;
            }
            let Some(viewer) = session.viewer.clone() else {
                return ReloadOutcome::Skipped;
            };
            if session.reload.in_flight {
                let at = self.clock.now().saturating_add(self.config.debounce_reload());
                session.timers.schedule(TimerKey::Reload, at);
                session.reload.deferred += 1;
                session.reload.trigger_deferred = true;
                debug!(at = %at, "reload in flight, trigger folded into the debounce window");
                return ReloadOutcome::Deferred;
            }
            session.reload.in_flight = true;
            session.reload.started += 1;
            session.pending_arrivals.clear();
            session.reload.trigger_deferred = false;
            session.removed_during_reload.clear();
            session.timers.cancel(&TimerKey::Reload);
            (session.epoch, viewer)
        };
        let _in_flight = InFlight { inner: self, epoch };

        let scope = match self.resolver.resolve_scope(&viewer).await {
            Ok(scope) => scope,
            Err(e) if e.is_session_expired() => {
                debug!(viewer = %viewer, "authorization session expired");
                self.teardown(true);
                return ReloadOutcome::SessionExpired;
            }
            Err(e) => {
                warn!(viewer = %viewer, error = %e, "permission scope unavailable, showing no calls");
                PermissionScope::none()
            }
        };
        if !self.is_current(epoch) {
            return ReloadOutcome::Cancelled;
        }

        let candidates = if scope.is_empty() {
            Vec::new()
        } else {
            match self.snapshots.fetch_candidates().await {
                Ok(records) => records,
                Err(e) => {
                    warn!(viewer = %viewer, error = %e, "snapshot unavailable, keeping last working set");
                    let mut session = self.session.lock();
                    if session.epoch == epoch {
                        session.reload.failed += 1;
                    }
                    return ReloadOutcome::SnapshotFailed;
                }
            }
        };

        let now = self.clock.now();
        let mut stats = ReloadStats {
            candidates: candidates.len(),
            ..ReloadStats::default()
        };
        let mut admitted = Vec::new();
        for record in candidates {
            let call = ClassifiedCall::new(record);
            if !call.is_active() {
                continue;
            }
            if !scope.permits(call.record.prospect_ref.as_ref()) {
                stats.denied += 1;
                continue;
            }
            admitted.push(call);
        }

        if scope.mode == ScopeMode::Scoped && !admitted.is_empty() {
            let mut authorized = Vec::with_capacity(admitted.len());
            for call in admitted {
                let Some(prospect) = call.record.prospect_ref.as_ref() else {
                    stats.denied += 1;
                    continue;
                };
                match self.resolver.authorize(&viewer, prospect).await {
                    Ok(true) => authorized.push(call),
                    Ok(false) => stats.denied += 1,
                    Err(e) if e.is_session_expired() => {
                        debug!(viewer = %viewer, "authorization session expired");
                        self.teardown(true);
                        return ReloadOutcome::SessionExpired;
                    }
                    Err(e) => {
                        debug!(call_id = %call.call_id(), error = %e, "authorization failed, hiding call");
                        stats.denied += 1;
                    }
                }
            }
            admitted = authorized;
        }

        // Only calls the viewer may see are checked for staleness.
        let mut stale = Vec::new();
        admitted.retain(|call| {
            if self.is_stale(&call.record, now) {
                stale.push(call.call_id().clone());
                false
            } else {
                true
            }
        });

        let mut session = self.session.lock();
        if session.epoch != epoch || !session.is_running() {
            return ReloadOutcome::Cancelled;
        }
        if !session.enabled {
            return ReloadOutcome::Skipped;
        }

        stats.stale = stale.len();
        for id in stale {
            if session.stale_reported.insert(id.clone()) {
                warn!(call_id = %id, "stale active call dropped");
            }
        }

        let next = self.reconcile(&mut session, admitted, mode);
        let diff = session.working_set.diff(&next);

        let mut notifications = Vec::new();
        for id in &diff.added {
            if session.notified.insert(id.clone()) {
                notifications.push(CallNotification {
                    call_id: id.clone(),
                    prospect_ref: next.get(id).and_then(|c| c.record.prospect_ref.clone()),
                    viewer: viewer.clone(),
                    at: now,
                });
            }
        }
        for id in &diff.removed {
            session.forget_extras(id);
        }

        stats.visible = next.len();
        stats.added = diff.added.len();
        stats.removed = diff.removed.len();
        stats.notified = notifications.len();

        let first_load = session.lifecycle == SessionState::Loading && session.reload.applied == 0;
        session.working_set = next;
        session.scope = Some(scope);
        session.reload.applied += 1;
        let update = if diff.is_empty() && !first_load {
            None
        } else {
            session.version += 1;
            Some(WorkingSetUpdate::new(session.version, diff, &session.working_set))
        };
        let effects = Effects {
            epoch,
            notifications,
            update,
        };
        drop(session);

        debug!(viewer = %viewer, stats = ?stats, "reload applied");
        self.flush(effects);
        ReloadOutcome::Applied(stats)
    }

    /// Builds the next working set from admitted snapshot calls.
    fn reconcile(&self, session: &mut Session, admitted: Vec<ClassifiedCall>, mode: ReloadMode) -> WorkingSet {
        let mut next = WorkingSet::new();

        let removed = core::mem::take(&mut session.removed_during_reload);
        for mut call in admitted {
            let id = call.call_id().clone();

            if let Some(&at) = removed.get(&id) {
                if call.record.last_activity() <= at {
                    debug!(call_id = %id, "call removed while the snapshot was in flight, skipped");
                    continue;
                }
            }

            if let Some(pending) = session.pending_removals.get(&id) {
                let event_is_newer = pending.latest.last_activity() >= call.record.last_activity();
                if mode == ReloadMode::Merge && event_is_newer {
                    // The grace period keeps running on the last ACTIVE version.
                    if let Some(current) = session.working_set.get(&id) {
                        next.insert(current.clone());
                        next.inherit_keys(&session.working_set, &id);
                    }
                    continue;
                }
                session.pending_removals.remove(&id);
                session.timers.cancel(&TimerKey::Removal(id.clone()));
            }

            if mode == ReloadMode::Merge {
                if let Some(current) = session.working_set.get(&id) {
                    if current.record.last_activity() > call.record.last_activity() {
                        next.insert(current.clone());
                        next.inherit_keys(&session.working_set, &id);
                        continue;
                    }
                    session.working_set.carry_incremental(&mut call);
                    next.insert(call);
                    next.inherit_keys(&session.working_set, &id);
                    continue;
                }
            }
            next.insert(call);
        }

        let gone: Vec<CallId> = session
            .pending_removals
            .keys()
            .filter(|id| !next.contains(id))
            .cloned()
            .collect();
        for id in gone {
            session.pending_removals.remove(&id);
            session.timers.cancel(&TimerKey::Removal(id));
        }
        next
    }

    /// Ends the session. `quiet` is used for the expected session-expiry path.
    fn teardown(&self, quiet: bool) {
        let (subscription, effects, viewer) = {
            let mut session = self.session.lock();
            if session.lifecycle == SessionState::TornDown {
                return;
            }
            let removed = session.clear();
            session.notified.clear();
            session.stale_reported.clear();
            session.scope = None;
            session.reload.in_flight = false;
            session.lifecycle = SessionState::TornDown;
            session.epoch += 1;
            let update = if removed.is_empty() {
                None
            } else {
                session.version += 1;
                Some(WorkingSetUpdate {
                    version: session.version,
                    removed,
                    ..WorkingSetUpdate::default()
                })
            };
            let viewer = session.viewer.take();
            session.role = None;
            (
                session.subscription.take(),
                Effects::new(session.epoch, update),
                viewer,
            )
        };

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.flush(effects);
        // Wait out a publication still running on another thread.
        drop(self.publish_gate.lock());

        let viewer = viewer.map(|v| v.to_string()).unwrap_or_default();
        if quiet {
            debug!(viewer = %viewer, "session cleared");
        } else {
            info!(viewer = %viewer, "session cleaned up");
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.session.get_mut().subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// Builder for [`ReconciliationStore`].
pub struct StoreBuilder {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    hub: ChangeFeedHub,
    snapshots: Arc<dyn SnapshotProvider>,
    resolver: Arc<dyn ScopeResolver>,
    sink: Arc<dyn NotificationSink>,
}

impl StoreBuilder {
    /// Sets the configuration. Defaults to [`SyncConfig::default`].
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the notification sink. Defaults to a sink that drops everything.
    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validates the configuration and builds the store.
    pub fn build(self) -> Result<ReconciliationStore> {
        self.config.validate()?;
        Ok(ReconciliationStore {
            inner: Arc::new(StoreInner {
                config: self.config,
                clock: self.clock,
                hub: self.hub,
                snapshots: self.snapshots,
                resolver: self.resolver,
                sink: self.sink,
                session: Mutex::new(Session::new()),
                observers: ObserverRegistry::new(),
                publish_gate: ReentrantMutex::new(Cell::new(0)),
            }),
        })
    }
}

/// One viewer session's reconciled view of the active calls.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ReconciliationStore {
    inner: Arc<StoreInner>,
}

impl ReconciliationStore {
    /// Starts building a store on top of a hub and its collaborators.
    pub fn builder(
        hub: ChangeFeedHub,
        snapshots: Arc<dyn SnapshotProvider>,
        resolver: Arc<dyn ScopeResolver>,
    ) -> StoreBuilder {
        StoreBuilder {
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            hub,
            snapshots,
            resolver,
            sink: Arc::new(NoopNotificationSink),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Starts the session for a viewer.
    ///
    /// Runs one full reload, then listens to every event type of the
    /// configured resource. Permission failures leave an empty, ready
    /// session; an expired authorization session leaves it torn down. Fails
    /// only if the session is already running.
    pub async fn initialize(&self, viewer: impl Into<ViewerId>, role: impl Into<String>) -> Result<()> {
        let viewer = viewer.into();
        let role = role.into();
        let epoch = {
            let mut session = self.inner.session.lock();
            if session.is_running() {
                return Err(Error::invalid_state(format!(
                    "session for {} is {}",
                    session.viewer.as_ref().map(ViewerId::as_str).unwrap_or("?"),
                    session.lifecycle
                )));
            }
            session.lifecycle = SessionState::Loading;
            session.viewer = Some(viewer.clone());
            session.role = Some(role.clone());
            session.reload = ReloadControl::default();
            session.epoch
        };

        let outcome = self.inner.full_reload(ReloadMode::Merge).await;
        if !self.inner.is_current(epoch) {
            debug!(viewer = %viewer, outcome = ?outcome, "session ended during initialization");
            return Ok(());
        }

        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .hub
            .subscribe(&self.inner.config.resource, &[EventFilter::All], move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_change_event(event);
                }
                Ok(())
            });

        let mut session = self.inner.session.lock();
        if session.epoch != epoch || session.lifecycle != SessionState::Loading {
            drop(session);
            subscription.unsubscribe();
            return Ok(());
        }
        session.subscription = Some(subscription);
        session.lifecycle = SessionState::Ready;
        drop(session);

        info!(viewer = %viewer, role = %role, outcome = ?outcome, "session initialized");
        Ok(())
    }

    /// Applies one change event. Never suspends.
    pub fn on_change_event(&self, event: &ChangeEvent) -> EventOutcome {
        self.inner.on_change_event(event)
    }

    /// Reloads from a bulk snapshot, keeping fields only change events delivered.
    pub async fn full_reload(&self) -> ReloadOutcome {
        self.inner.full_reload(ReloadMode::Merge).await
    }

    /// Reloads with an explicit [`ReloadMode`].
    pub async fn reload(&self, mode: ReloadMode) -> ReloadOutcome {
        self.inner.full_reload(mode).await
    }

    /// Acts on every timer due at the clock's current time.
    ///
    /// Grace periods that ran out remove their calls; a due debounce runs
    /// the full reload before returning.
    pub async fn run_due_timers(&self) -> TimerReport {
        let now = self.inner.clock.now();
        let mut report = TimerReport::default();
        let mut reload_due = false;
        let mut diff = WorkingSetDiff::default();

        let effects = {
            let mut session = self.inner.session.lock();
            if !session.is_running() {
                return report;
            }
            for key in session.timers.pop_due(now) {
                match key {
                    TimerKey::Removal(id) => {
                        if session.pending_removals.remove(&id).is_some()
                            && session.working_set.remove(&id).is_some()
                        {
                            session.forget_extras(&id);
                            session.record_removal(&id, now);
                            debug!(call_id = %id, "grace period over, call removed");
                            diff.removed.push(id.clone());
                            report.removed.push(id);
                        }
                    }
                    TimerKey::Reload => {
                        session.reload.trigger_deferred = false;
                        reload_due = true;
                    }
                }
            }
            diff.removed.sort();
            let epoch = session.epoch;
            Effects::new(epoch, session.commit(diff))
        };
        self.inner.flush(effects);

        if reload_due {
            report.reload = Some(self.inner.full_reload(ReloadMode::Merge).await);
        }
        report
    }

    /// Returns the earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner.session.lock().timers.next_deadline()
    }

    /// Runs due timers every `poll` until the session is torn down.
    pub async fn drive(&self, poll: Duration) {
        loop {
            if self.state() == SessionState::TornDown {
                break;
            }
            self.run_due_timers().await;
            tokio::time::sleep(poll).await;
        }
    }

    /// Ends the session.
    ///
    /// Cancels every timer and the change-feed registration before
    /// returning; nothing is published or notified afterwards. The session
    /// can be initialized again later.
    pub fn cleanup(&self) {
        self.inner.teardown(false);
    }

    /// Enables or disables the session.
    ///
    /// Disabling clears the working set and timers and makes the store
    /// ignore events. Enabling again runs a full reload.
    pub async fn set_enabled(&self, enabled: bool) -> Option<ReloadOutcome> {
        let effects = {
            let mut session = self.inner.session.lock();
            if session.enabled == enabled {
                return None;
            }
            session.enabled = enabled;
            if enabled {
                None
            } else {
                let removed = session.clear();
                let epoch = session.epoch;
                let diff = WorkingSetDiff {
                    removed,
                    ..WorkingSetDiff::default()
                };
                Some(Effects::new(epoch, session.commit(diff)))
            }
        };
        debug!(enabled, "session toggled");

        match effects {
            Some(effects) => {
                self.inner.flush(effects);
                None
            }
            None => Some(self.inner.full_reload(ReloadMode::Merge).await),
        }
    }

    /// Registers a working-set observer.
    ///
    /// The callback runs after each change with the complete working set.
    /// It is not called with the current state on registration; use
    /// [`ReconciliationStore::snapshot`] for that.
    pub fn subscribe_to_working_set<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&WorkingSetUpdate) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    /// Returns the current working set as an update with no changes listed.
    pub fn snapshot(&self) -> WorkingSetUpdate {
        let session = self.inner.session.lock();
        WorkingSetUpdate {
            version: session.version,
            calls: session.working_set.calls(),
            ..WorkingSetUpdate::default()
        }
    }

    /// Returns the visible calls, newest first.
    pub fn calls(&self) -> Vec<ClassifiedCall> {
        self.inner.session.lock().working_set.calls()
    }

    /// Returns a visible call.
    pub fn get(&self, id: &CallId) -> Option<ClassifiedCall> {
        self.inner.session.lock().working_set.get(id).cloned()
    }

    /// Returns the working-set version.
    pub fn version(&self) -> u64 {
        self.inner.session.lock().version
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.lock().lifecycle
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.session.lock().enabled
    }

    /// Returns true if the call is waiting out its grace period.
    pub fn is_pending_removal(&self, id: &CallId) -> bool {
        self.inner.session.lock().pending_removals.contains_key(id)
    }

    /// Focuses (expands) a visible call. Returns false if it is not visible.
    pub fn focus(&self, id: &CallId) -> bool {
        let mut session = self.inner.session.lock();
        if !session.working_set.contains(id) {
            return false;
        }
        session.focused = Some(id.clone());
        true
    }

    /// Clears the focused call.
    pub fn clear_focus(&self) {
        self.inner.session.lock().focused = None;
    }

    /// Returns the focused call, if it is still visible.
    pub fn focused(&self) -> Option<ClassifiedCall> {
        let session = self.inner.session.lock();
        session
            .focused
            .as_ref()
            .and_then(|id| session.working_set.get(id))
            .cloned()
    }

    /// Replaces the live transcript of a visible call.
    pub fn update_transcript(&self, id: &CallId, entries: Vec<TranscriptEntry>) -> bool {
        let mut session = self.inner.session.lock();
        if !session.working_set.contains(id) {
            return false;
        }
        session.transcripts.insert(id.clone(), entries);
        true
    }

    /// Returns the live transcript of a call.
    pub fn transcript(&self, id: &CallId) -> Vec<TranscriptEntry> {
        self.inner
            .session
            .lock()
            .transcripts
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the change-feed summary for the configured resource.
    pub fn hub_diagnostics(&self) -> FeedDiagnostics {
        let hub = self.inner.hub.diagnostics();
        FeedDiagnostics {
            open_channels: hub.open_channels,
            listener_count: hub.listener_count,
            connected: hub.connected(&self.inner.config.resource),
        }
    }

    /// Returns the store's counters.
    pub fn diagnostics(&self) -> StoreDiagnostics {
        let feed = self.hub_diagnostics();
        let session = self.inner.session.lock();
        StoreDiagnostics {
            state: session.lifecycle,
            enabled: session.enabled,
            viewer: session.viewer.clone(),
            role: session.role.clone(),
            working_set: session.working_set.len(),
            pending_removals: session.pending_removals.len(),
            pending_arrivals: session.pending_arrivals.len(),
            reload_scheduled: session.timers.is_scheduled(&TimerKey::Reload),
            reload_in_flight: session.reload.in_flight,
            reloads_started: session.reload.started,
            reloads_applied: session.reload.applied,
            reloads_deferred: session.reload.deferred,
            reloads_failed: session.reload.failed,
            notified: session.notified.len(),
            stale_reported: session.stale_reported.len(),
            version: session.version,
            feed,
        }
    }
}

impl fmt::Debug for ReconciliationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("ReconciliationStore")
            .field("state", &session.lifecycle)
            .field("viewer", &session.viewer)
            .field("working_set", &session.working_set.len())
            .field("version", &session.version)
            .finish_non_exhaustive()
    }
}
