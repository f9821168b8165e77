//! Livecall Store - Per-viewer reconciliation of live call state.
//!
//! This crate keeps each viewer's working set of visible ACTIVE calls
//! consistent by combining bulk snapshots with change events from a
//! [`livecall_hub::ChangeFeedHub`]:
//!
//! - `ReconciliationStore`: Session lifecycle, event merging, grace-period
//!   removal, debounced reloads and observer publication
//! - `WorkingSet`: The visible calls and the diffs published for them
//! - `TimerQueue`: Keyed deadlines driven by an injectable clock
//! - `SnapshotProvider`, `ScopeResolver`, `NotificationSink`: Collaborator seams
//! - `CachedScopeResolver`: TTL cache in front of a scope resolver
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use livecall_core::{ProspectRef, RawCallRecord, RawStatus, Result, Timestamp, ViewerId};
//! use livecall_hub::{ChangeFeedHub, MemoryTransport};
//! use livecall_store::{PermissionScope, ReconciliationStore, ScopeResolver, SnapshotProvider};
//! use std::sync::Arc;
//!
//! struct OneCall;
//!
//! #[async_trait]
//! impl SnapshotProvider for OneCall {
//!     async fn fetch_candidates(&self) -> Result<Vec<RawCallRecord>> {
//!         Ok(vec![RawCallRecord::new("call-1", RawStatus::Active, Timestamp::EPOCH)])
//!     }
//! }
//!
//! struct Everyone;
//!
//! #[async_trait]
//! impl ScopeResolver for Everyone {
//!     async fn resolve_scope(&self, _: &ViewerId) -> Result<PermissionScope> {
//!         Ok(PermissionScope::full())
//!     }
//!     async fn authorize(&self, _: &ViewerId, _: &ProspectRef) -> Result<bool> {
//!         Ok(true)
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let hub = ChangeFeedHub::new("calls-hub", Arc::new(MemoryTransport::new()));
//! let clock = Arc::new(livecall_core::ManualClock::new(Timestamp::EPOCH));
//! let store = ReconciliationStore::builder(hub, Arc::new(OneCall), Arc::new(Everyone))
//!     .clock(clock)
//!     .build()
//!     .unwrap();
//!
//! store.initialize("viewer-1", "admin").await.unwrap();
//! assert_eq!(store.calls().len(), 1);
//!
//! store.cleanup();
//! assert!(store.calls().is_empty());
//! # });
//! ```

pub mod collaborators;
pub mod observer;
pub mod scope_cache;
mod store;
pub mod timer;
pub mod transcript;
pub mod working_set;

pub use collaborators::{
    CallNotification, NoopNotificationSink, NotificationSink, PermissionScope, ScopeMode,
    ScopeResolver, SnapshotProvider,
};
pub use observer::{Observer, ObserverHandle, ObserverId, ObserverRegistry};
pub use scope_cache::CachedScopeResolver;
pub use store::{
    EventOutcome, FeedDiagnostics, ReconciliationStore, ReloadMode, ReloadOutcome, ReloadStats,
    SessionState, StoreBuilder, StoreDiagnostics, TimerReport,
};
pub use timer::{TimerKey, TimerQueue};
pub use transcript::{Speaker, TranscriptEntry};
pub use working_set::{WorkingSet, WorkingSetDiff, WorkingSetUpdate};
