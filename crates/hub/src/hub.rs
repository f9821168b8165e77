//! Change-feed hub.
//!
//! `ChangeFeedHub` owns at most one open channel per resource and fans each
//! event out to every listener registered for that resource. Channels are
//! reference counted by listener: the first `subscribe` opens the channel,
//! the last `unsubscribe` closes it.
//!
//! # Example
//!
//! ```
//! use livecall_hub::{ChangeEvent, ChangeFeedHub, EventFilter, MemoryTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let hub = ChangeFeedHub::new("hub", transport.clone());
//!
//! let sub = hub.subscribe("sales_calls", &[EventFilter::All], |event| {
//!     assert_eq!(event.resource, "sales_calls");
//!     Ok(())
//! });
//! assert!(hub.is_connected("sales_calls"));
//!
//! transport.emit("sales_calls", ChangeEvent::insert("sales_calls", json!({ "call_id": "c-1" })));
//!
//! sub.unsubscribe();
//! assert_eq!(hub.diagnostics().open_channels, 0);
//! ```

use crate::event::{ChangeEvent, EventFilter, EventFilterSet};
use crate::listener::{ListenerId, ListenerIndex, ListenerResult};
use crate::transport::{ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus, Transport};
use core::fmt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

struct ChannelEntry {
    generation: u64,
    status: ChannelStatus,
    last_error: Option<String>,
    handle: Option<Box<dyn ChannelHandle>>,
}

struct HubState {
    channels: HashMap<String, ChannelEntry>,
    listeners: ListenerIndex,
    next_generation: u64,
    transport_errors: u64,
}

/// State shared between the hub, its subscriptions and its channel sinks.
pub(crate) struct HubShared {
    name: String,
    state: Mutex<HubState>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

fn close_channel(hub: &str, resource: &str, mut handle: Box<dyn ChannelHandle>) {
    match handle.close() {
        Ok(()) => info!(hub = %hub, resource = %resource, "channel closed"),
        Err(e) => warn!(hub = %hub, resource = %resource, error = %e, "channel close failed"),
    }
}

impl HubShared {
    /// Runs every matching listener. Callbacks run outside the state lock.
    fn dispatch(&self, resource: &str, event: &ChangeEvent) -> usize {
        let callbacks = self.state.lock().listeners.matching(resource, event.event_type);

        for (id, callback) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    hub = %self.name,
                    resource = %resource,
                    event_type = %event.event_type,
                    listener = id,
                    error = %e,
                    "listener failed"
                ),
                Err(panic) => error!(
                    hub = %self.name,
                    resource = %resource,
                    event_type = %event.event_type,
                    listener = id,
                    panic = %panic_message(panic.as_ref()),
                    "listener panicked"
                ),
            }
        }
        callbacks.len()
    }

    pub(crate) fn is_current(&self, resource: &str, generation: u64) -> bool {
        self.state
            .lock()
            .channels
            .get(resource)
            .is_some_and(|c| c.generation == generation)
    }

    pub(crate) fn deliver(&self, resource: &str, generation: u64, event: &ChangeEvent) -> bool {
        if !self.is_current(resource, generation) {
            debug!(hub = %self.name, resource = %resource, "dropping event from closed channel");
            return false;
        }
        self.dispatch(resource, event);
        true
    }

    pub(crate) fn report_status(&self, resource: &str, generation: u64, status: ChannelStatus) {
        let mut state = self.state.lock();
        let Some(entry) = state
            .channels
            .get_mut(resource)
            .filter(|c| c.generation == generation)
        else {
            return;
        };

        let failure = status.is_failure();
        if let ChannelStatus::Errored(message) = &status {
            entry.last_error = Some(message.clone());
        } else if status == ChannelStatus::TimedOut {
            entry.last_error = Some("timed out".to_string());
        }
        entry.status = status.clone();
        if failure {
            state.transport_errors += 1;
            drop(state);
            warn!(hub = %self.name, resource = %resource, status = %status, "channel problem");
        } else {
            drop(state);
            debug!(hub = %self.name, resource = %resource, status = %status, "channel status");
        }
    }

    /// Removes a listener; returns the channel handle to close if it was the last.
    fn remove_listener(&self, id: ListenerId) -> Option<(String, Option<Box<dyn ChannelHandle>>)> {
        let mut state = self.state.lock();
        let resource = state.listeners.unregister(id)?;
        if state.listeners.has_listeners(&resource) {
            return None;
        }
        let entry = state.channels.remove(&resource)?;
        Some((resource, entry.handle))
    }
}

/// Handle returned by [`ChangeFeedHub::subscribe`].
///
/// `unsubscribe` is idempotent. Dropping the handle does not unsubscribe.
pub struct Subscription {
    id: ListenerId,
    resource: String,
    hub: Weak<HubShared>,
    active: AtomicBool,
}

impl Subscription {
    /// Returns the listener ID.
    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the subscribed resource.
    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns true until `unsubscribe` is called.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the listener. The last listener of a resource closes its channel.
    ///
    /// Returns true if this call removed the listener.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        match hub.remove_listener(self.id) {
            Some((resource, Some(handle))) => {
                close_channel(&hub.name, &resource, handle);
                true
            }
            Some((_, None)) | None => true,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Per-resource diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDiagnostics {
    pub resource: String,
    pub channel: String,
    pub listeners: usize,
    pub status: ChannelStatus,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Snapshot of the hub's channels and listeners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubDiagnostics {
    pub hub: String,
    pub open_channels: usize,
    pub listener_count: usize,
    pub transport_errors: u64,
    /// Sorted by resource name.
    pub resources: Vec<ResourceDiagnostics>,
}

impl HubDiagnostics {
    /// Returns the entry for a resource.
    pub fn resource(&self, resource: &str) -> Option<&ResourceDiagnostics> {
        self.resources.iter().find(|r| r.resource == resource)
    }

    /// Returns true if the resource's channel is connected.
    pub fn connected(&self, resource: &str) -> bool {
        self.resource(resource).is_some_and(|r| r.connected)
    }
}

/// Multiplexes one change-feed channel per resource to many listeners.
#[derive(Clone)]
pub struct ChangeFeedHub {
    shared: Arc<HubShared>,
    transport: Arc<dyn Transport>,
}

impl ChangeFeedHub {
    /// Creates a hub. `name` prefixes channel names.
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(HubShared {
                name: name.into(),
                state: Mutex::new(HubState {
                    channels: HashMap::new(),
                    listeners: ListenerIndex::new(),
                    next_generation: 1,
                    transport_errors: 0,
                }),
            }),
            transport,
        }
    }

    /// Returns the hub name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the channel name used for a resource.
    pub fn channel_name(&self, resource: &str) -> String {
        format!("{}-{}", self.shared.name, resource)
    }

    /// Registers a listener for `resource`.
    ///
    /// An empty `filters` list listens to every event type. Opening the
    /// channel never fails from the caller's point of view: transport errors
    /// are logged and show up in [`ChangeFeedHub::diagnostics`].
    pub fn subscribe<F>(&self, resource: &str, filters: &[EventFilter], callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) -> ListenerResult + Send + Sync + 'static,
    {
        let filters = EventFilterSet::from_filters(filters);
        let (id, open) = {
            let mut state = self.shared.state.lock();
            let id = state.listeners.register(resource, filters, Arc::new(callback));
            let open = if state.channels.contains_key(resource) {
                None
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.channels.insert(
                    resource.to_string(),
                    ChannelEntry {
                        generation,
                        status: ChannelStatus::Connecting,
                        last_error: None,
                        handle: None,
                    },
                );
                Some(generation)
            };
            (id, open)
        };

        debug!(hub = %self.shared.name, resource = %resource, listener = id, "listener registered");
        if let Some(generation) = open {
            self.open_channel(resource, generation);
        }

        Subscription {
            id,
            resource: resource.to_string(),
            hub: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        }
    }

    fn open_channel(&self, resource: &str, generation: u64) {
        let spec = ChannelSpec {
            name: self.channel_name(resource),
            resource: resource.to_string(),
        };
        let sink = ChannelSink::new(Arc::downgrade(&self.shared), resource, generation);

        match self.transport.open(&spec, sink) {
            Ok(handle) => {
                let orphan = {
                    let mut state = self.shared.state.lock();
                    match state.channels.get_mut(resource) {
                        Some(entry) if entry.generation == generation => {
                            entry.handle = Some(handle);
                            None
                        }
                        _ => Some(handle),
                    }
                };
                match orphan {
                    // Every listener left while the channel was opening.
                    Some(handle) => close_channel(&self.shared.name, resource, handle),
                    None => info!(hub = %self.shared.name, channel = %spec.name, "channel opened"),
                }
            }
            Err(e) => {
                warn!(hub = %self.shared.name, channel = %spec.name, error = %e, "channel open failed");
                let mut state = self.shared.state.lock();
                state.transport_errors += 1;
                if let Some(entry) = state
                    .channels
                    .get_mut(resource)
                    .filter(|c| c.generation == generation)
                {
                    entry.status = ChannelStatus::Errored(e.to_string());
                    entry.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Runs every listener matching the event's type on `resource`.
    ///
    /// Listeners naming the type run first, then `*` listeners. A failing or
    /// panicking listener is logged and does not stop the others. Returns the
    /// number of listeners invoked.
    pub fn dispatch(&self, resource: &str, event: &ChangeEvent) -> usize {
        self.shared.dispatch(resource, event)
    }

    /// Returns the number of listeners on a resource.
    pub fn listener_count(&self, resource: &str) -> usize {
        self.shared.state.lock().listeners.listener_count(resource)
    }

    /// Returns true if the resource's channel has confirmed its subscription.
    pub fn is_connected(&self, resource: &str) -> bool {
        self.channel_status(resource)
            .is_some_and(|s| s.is_connected())
    }

    /// Returns the status of a resource's channel, if one is open.
    pub fn channel_status(&self, resource: &str) -> Option<ChannelStatus> {
        self.shared
            .state
            .lock()
            .channels
            .get(resource)
            .map(|c| c.status.clone())
    }

    /// Returns a diagnostics snapshot.
    pub fn diagnostics(&self) -> HubDiagnostics {
        let state = self.shared.state.lock();
        let mut resources: Vec<ResourceDiagnostics> = state
            .channels
            .iter()
            .map(|(resource, entry)| ResourceDiagnostics {
                resource: resource.clone(),
                channel: self.channel_name(resource),
                listeners: state.listeners.listener_count(resource),
                status: entry.status.clone(),
                connected: entry.status.is_connected(),
                last_error: entry.last_error.clone(),
            })
            .collect();
        resources.sort_by(|a, b| a.resource.cmp(&b.resource));

        HubDiagnostics {
            hub: self.shared.name.clone(),
            open_channels: state.channels.len(),
            listener_count: state.listeners.len(),
            transport_errors: state.transport_errors,
            resources,
        }
    }

    /// Closes every channel and drops every listener.
    ///
    /// Outstanding [`Subscription`]s become inert.
    pub fn cleanup(&self) {
        let handles: Vec<(String, Box<dyn ChannelHandle>)> = {
            let mut state = self.shared.state.lock();
            state.listeners.clear();
            state
                .channels
                .drain()
                .filter_map(|(resource, entry)| entry.handle.map(|h| (resource, h)))
                .collect()
        };

        let closed = handles.len();
        for (resource, handle) in handles {
            close_channel(&self.shared.name, &resource, handle);
        }
        info!(hub = %self.shared.name, closed, "hub cleaned up");
    }
}

impl fmt::Debug for ChangeFeedHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeedHub")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}
