//! TTL cache in front of a [`ScopeResolver`].
//!
//! Successful answers are reused until they expire. Errors are never cached,
//! so a resolver outage is retried on the next call and keeps failing closed.

use crate::collaborators::{PermissionScope, ScopeResolver};
use async_trait::async_trait;
use core::time::Duration;
use hashbrown::HashMap;
use livecall_core::{Clock, ProspectRef, Result, Timestamp, ViewerId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
struct Cached<T> {
    value: T,
    expires_at: Timestamp,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, now: Timestamp) -> Option<T> {
        (now < self.expires_at).then(|| self.value.clone())
    }
}

/// Caches scopes and per-prospect authorizations for a fixed TTL.
pub struct CachedScopeResolver<R> {
    inner: R,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    scopes: Mutex<HashMap<ViewerId, Cached<PermissionScope>>>,
    grants: Mutex<HashMap<(ViewerId, ProspectRef), Cached<bool>>>,
}

impl<R: ScopeResolver> CachedScopeResolver<R> {
    /// Wraps `inner`, caching answers for `ttl` as measured by `clock`.
    pub fn new(inner: R, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            inner,
            clock,
            ttl,
            scopes: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped resolver.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Drops every cached answer for a viewer.
    pub fn invalidate(&self, viewer: &ViewerId) {
        self.scopes.lock().remove(viewer);
        self.grants.lock().retain(|(v, _), _| v != viewer);
        debug!(viewer = %viewer, "scope cache invalidated");
    }

    /// Drops every cached answer.
    pub fn clear(&self) {
        self.scopes.lock().clear();
        self.grants.lock().clear();
    }

    /// Returns the number of cached scopes and authorizations.
    pub fn len(&self) -> usize {
        self.scopes.lock().len() + self.grants.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<R: ScopeResolver> ScopeResolver for CachedScopeResolver<R> {
    async fn resolve_scope(&self, viewer: &ViewerId) -> Result<PermissionScope> {
        let now = self.clock.now();
        if let Some(scope) = self.scopes.lock().get(viewer).and_then(|c| c.fresh(now)) {
            return Ok(scope);
        }

        let scope = self.inner.resolve_scope(viewer).await?;
        self.scopes.lock().insert(
            viewer.clone(),
            Cached {
                value: scope.clone(),
                expires_at: self.clock.now().saturating_add(self.ttl),
            },
        );
        Ok(scope)
    }

    async fn authorize(&self, viewer: &ViewerId, prospect: &ProspectRef) -> Result<bool> {
        let key = (viewer.clone(), prospect.clone());
        let now = self.clock.now();
        if let Some(granted) = self.grants.lock().get(&key).and_then(|c| c.fresh(now)) {
            return Ok(granted);
        }

        let granted = self.inner.authorize(viewer, prospect).await?;
        self.grants.lock().insert(
            key,
            Cached {
                value: granted,
                expires_at: self.clock.now().saturating_add(self.ttl),
            },
        );
        Ok(granted)
    }
}
