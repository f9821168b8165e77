//! Listener registrations for change feeds.
//!
//! This module provides listener IDs, the callback contract, and an index
//! routing a resource and event type to the registrations that want it.

use crate::event::{ChangeEvent, EventFilterSet, EventType};
use hashbrown::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Unique identifier for a listener registration.
pub type ListenerId = u64;

/// Failure reported by a listener callback.
///
/// The hub logs it and moves on to the next listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    /// Creates a listener error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<livecall_core::Error> for ListenerError {
    fn from(err: livecall_core::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Result returned by listener callbacks.
pub type ListenerResult = Result<(), ListenerError>;

/// Callback invoked for each matching change event.
pub type ListenerCallback = Arc<dyn Fn(&ChangeEvent) -> ListenerResult + Send + Sync>;

/// A registered listener: resource, event filters and callback.
#[derive(Clone)]
pub struct ListenerRegistration {
    id: ListenerId,
    resource: String,
    filters: EventFilterSet,
    callback: ListenerCallback,
}

impl ListenerRegistration {
    /// Creates a registration.
    pub fn new(
        id: ListenerId,
        resource: impl Into<String>,
        filters: EventFilterSet,
        callback: ListenerCallback,
    ) -> Self {
        Self {
            id,
            resource: resource.into(),
            filters,
            callback,
        }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[inline]
    pub fn filters(&self) -> EventFilterSet {
        self.filters
    }

    /// Returns a handle to the callback.
    #[inline]
    pub fn callback(&self) -> ListenerCallback {
        Arc::clone(&self.callback)
    }
}

impl core::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Routes resources to their listener registrations.
pub struct ListenerIndex {
    /// Resource -> registrations, in registration order
    by_resource: HashMap<String, Vec<ListenerRegistration>>,
    /// Listener ID -> owning resource
    owners: HashMap<ListenerId, String>,
    /// Next listener ID to assign
    next_id: ListenerId,
}

impl Default for ListenerIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            by_resource: HashMap::new(),
            owners: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a listener and returns its ID. IDs are never reused.
    pub fn register(
        &mut self,
        resource: &str,
        filters: EventFilterSet,
        callback: ListenerCallback,
    ) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;

        self.by_resource
            .entry(resource.to_string())
            .or_default()
            .push(ListenerRegistration::new(id, resource, filters, callback));
        self.owners.insert(id, resource.to_string());

        id
    }

    /// Unregisters a listener by ID.
    ///
    /// Returns the resource the listener belonged to, or `None` if the ID
    /// is unknown (already removed).
    pub fn unregister(&mut self, id: ListenerId) -> Option<String> {
        let resource = self.owners.remove(&id)?;
        if let Some(list) = self.by_resource.get_mut(&resource) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                self.by_resource.remove(&resource);
            }
        }
        Some(resource)
    }

    /// Returns the callbacks that should receive an event, each at most once.
    ///
    /// Listeners naming the event type come first, then wildcard-only
    /// listeners, each group in registration order.
    pub fn matching(&self, resource: &str, event_type: EventType) -> Vec<(ListenerId, ListenerCallback)> {
        let Some(list) = self.by_resource.get(resource) else {
            return Vec::new();
        };

        let specific = list.iter().filter(|r| r.filters.names(event_type));
        let wildcard = list
            .iter()
            .filter(|r| !r.filters.names(event_type) && r.filters.is_wildcard());

        specific
            .chain(wildcard)
            .map(|r| (r.id, r.callback()))
            .collect()
    }

    /// Returns the number of listeners on a resource.
    pub fn listener_count(&self, resource: &str) -> usize {
        self.by_resource.get(resource).map_or(0, Vec::len)
    }

    /// Returns true if the resource has at least one listener.
    #[inline]
    pub fn has_listeners(&self, resource: &str) -> bool {
        self.listener_count(resource) > 0
    }

    /// Returns the total number of listeners.
    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if there are no listeners.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Returns the resources that currently have listeners.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.by_resource.keys().map(String::as_str)
    }

    /// Clears all listeners. The ID counter keeps running.
    pub fn clear(&mut self) {
        self.by_resource.clear();
        self.owners.clear();
    }
}
