//! Collaborators consumed by the reconciliation store.
//!
//! The store never talks to the network itself. Bulk snapshots, permission
//! lookups and alerting are reached through the traits in this module.

use async_trait::async_trait;
use hashbrown::HashSet;
use livecall_core::{CallId, ProspectRef, RawCallRecord, Result, Timestamp, ViewerId};
use serde::{Deserialize, Serialize};

/// Source of the current candidate records.
///
/// May be expensive; the store only calls it from a full reload.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Fetches every record that might currently be active.
    async fn fetch_candidates(&self) -> Result<Vec<RawCallRecord>>;
}

/// How much of the dataset a viewer may see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeMode {
    /// Every record.
    Full,
    /// Only records of the allowed prospects.
    Scoped,
}

/// A viewer's visibility scope.
///
/// This is a presentation filter layered over server-side authorization,
/// not a replacement for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionScope {
    pub mode: ScopeMode,
    pub allowed: HashSet<ProspectRef>,
}

impl PermissionScope {
    /// Scope that sees every record.
    pub fn full() -> Self {
        Self {
            mode: ScopeMode::Full,
            allowed: HashSet::new(),
        }
    }

    /// Scope limited to the given prospects.
    pub fn scoped<I, P>(allowed: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProspectRef>,
    {
        Self {
            mode: ScopeMode::Scoped,
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Scope that sees nothing.
    pub fn none() -> Self {
        Self::scoped(core::iter::empty::<ProspectRef>())
    }

    /// Returns true if the scope can never admit a record.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mode == ScopeMode::Scoped && self.allowed.is_empty()
    }

    /// Coarse check of a record's prospect against the scope.
    ///
    /// In scoped mode a record without a prospect is never visible.
    pub fn permits(&self, prospect: Option<&ProspectRef>) -> bool {
        match self.mode {
            ScopeMode::Full => true,
            ScopeMode::Scoped => prospect.is_some_and(|p| self.allowed.contains(p)),
        }
    }
}

/// Answers visibility questions for a viewer.
///
/// Any error must be treated by callers as "nothing visible".
#[async_trait]
pub trait ScopeResolver: Send + Sync {
    /// Resolves the viewer's scope.
    async fn resolve_scope(&self, viewer: &ViewerId) -> Result<PermissionScope>;

    /// Re-checks a single prospect for the viewer.
    async fn authorize(&self, viewer: &ViewerId, prospect: &ProspectRef) -> Result<bool>;
}

/// A call that newly became visible to the viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallNotification {
    pub call_id: CallId,
    pub prospect_ref: Option<ProspectRef>,
    pub viewer: ViewerId,
    pub at: Timestamp,
}

/// Fire-and-forget alerting (sound, toast).
///
/// Failures are logged by the store and otherwise ignored.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &CallNotification) -> Result<()>;
}

/// Sink that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _notification: &CallNotification) -> Result<()> {
        Ok(())
    }
}
