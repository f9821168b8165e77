//! The transport seam under the hub.
//!
//! A [`Transport`] opens one channel per resource and pushes events and
//! status changes back through the [`ChannelSink`] it was handed. Retry and
//! reconnect policy belong to the transport, the hub never retries.

use crate::event::ChangeEvent;
use crate::hub::HubShared;
use core::fmt;
use hashbrown::HashMap;
use livecall_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};

/// Connection state of a channel, as reported by its transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "status", content = "message")]
pub enum ChannelStatus {
    /// Opened, not yet confirmed.
    Connecting,
    /// Confirmed and receiving events.
    Subscribed,
    /// The channel reported an error.
    Errored(String),
    /// The channel timed out.
    TimedOut,
    /// The transport closed the channel.
    Closed,
}

impl ChannelStatus {
    /// Returns true only for `Subscribed`.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Subscribed)
    }

    /// Returns true for error and timeout states.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Errored(_) | ChannelStatus::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Connecting => f.write_str("CONNECTING"),
            ChannelStatus::Subscribed => f.write_str("SUBSCRIBED"),
            ChannelStatus::Errored(msg) => write!(f, "CHANNEL_ERROR: {}", msg),
            ChannelStatus::TimedOut => f.write_str("TIMED_OUT"),
            ChannelStatus::Closed => f.write_str("CLOSED"),
        }
    }
}

/// What the hub asks a transport to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel name, `{hub}-{resource}`.
    pub name: String,
    /// Monitored resource.
    pub resource: String,
}

/// An open channel. Dropping the handle does not close it; call `close`.
pub trait ChannelHandle: Send {
    /// Closes the channel.
    fn close(&mut self) -> Result<()>;
}

/// Opens change-feed channels.
pub trait Transport: Send + Sync {
    /// Opens a channel and starts pushing events into `sink`.
    fn open(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<Box<dyn ChannelHandle>>;
}

/// Where a transport delivers events and status changes for one channel.
///
/// A sink is bound to one opening of a channel. Once that channel is closed
/// (or the hub is gone) the sink silently drops whatever it receives.
#[derive(Clone)]
pub struct ChannelSink {
    hub: Weak<HubShared>,
    resource: String,
    generation: u64,
}

impl ChannelSink {
    pub(crate) fn new(hub: Weak<HubShared>, resource: impl Into<String>, generation: u64) -> Self {
        Self {
            hub,
            resource: resource.into(),
            generation,
        }
    }

    /// Returns the resource this sink feeds.
    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Dispatches an event to the listeners of the resource.
    ///
    /// Returns false if the channel this sink belongs to is no longer open.
    pub fn deliver(&self, event: ChangeEvent) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.deliver(&self.resource, self.generation, &event),
            None => false,
        }
    }

    /// Reports a connection state change.
    pub fn report_status(&self, status: ChannelStatus) {
        if let Some(hub) = self.hub.upgrade() {
            hub.report_status(&self.resource, self.generation, status);
        }
    }

    /// Returns true while the channel this sink belongs to is open.
    pub fn is_live(&self) -> bool {
        self.hub
            .upgrade()
            .is_some_and(|hub| hub.is_current(&self.resource, self.generation))
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("resource", &self.resource)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Default)]
struct MemoryState {
    /// Resource -> (channel token, channel name, sink)
    open: HashMap<String, (u64, String, ChannelSink)>,
    next_token: u64,
    opened_total: usize,
    closed_total: usize,
    fail_next_opens: usize,
}

/// In-process loopback transport.
///
/// Events pushed with [`MemoryTransport::emit`] reach the hub synchronously.
/// Channels confirm `Subscribed` as soon as they open unless built with
/// [`MemoryTransport::without_auto_connect`].
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    auto_connect: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates a transport whose channels connect immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            auto_connect: true,
        }
    }

    /// Creates a transport whose channels stay `Connecting` until reported otherwise.
    pub fn without_auto_connect() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Pushes an event into the open channel for `resource`.
    ///
    /// Returns false if no channel is open for it.
    pub fn emit(&self, resource: &str, event: ChangeEvent) -> bool {
        let sink = self.state.lock().open.get(resource).map(|(_, _, s)| s.clone());
        match sink {
            Some(sink) => sink.deliver(event),
            None => false,
        }
    }

    /// Reports a status change on the open channel for `resource`.
    pub fn report(&self, resource: &str, status: ChannelStatus) -> bool {
        let sink = self.state.lock().open.get(resource).map(|(_, _, s)| s.clone());
        match sink {
            Some(sink) => {
                sink.report_status(status);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_next_opens = count;
    }

    /// Returns the number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Returns true if a channel is open for `resource`.
    pub fn is_open(&self, resource: &str) -> bool {
        self.state.lock().open.contains_key(resource)
    }

    /// Returns the name of the open channel for `resource`.
    pub fn channel_name(&self, resource: &str) -> Option<String> {
        self.state.lock().open.get(resource).map(|(_, name, _)| name.clone())
    }

    /// Returns how many channels were ever opened.
    pub fn opened_total(&self) -> usize {
        self.state.lock().opened_total
    }

    /// Returns how many channels were ever closed.
    pub fn closed_total(&self) -> usize {
        self.state.lock().closed_total
    }
}

impl Transport for MemoryTransport {
    fn open(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<Box<dyn ChannelHandle>> {
        let token = {
            let mut state = self.state.lock();
            if state.fail_next_opens > 0 {
                state.fail_next_opens -= 1;
                return Err(Error::transport(&spec.resource, "open refused"));
            }
            if state.open.contains_key(&spec.resource) {
                return Err(Error::transport(&spec.resource, "channel already open"));
            }
            state.next_token += 1;
            state.opened_total += 1;
            let token = state.next_token;
            state
                .open
                .insert(spec.resource.clone(), (token, spec.name.clone(), sink.clone()));
            token
        };

        if self.auto_connect {
            sink.report_status(ChannelStatus::Subscribed);
        }

        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            resource: spec.resource.clone(),
            token,
            closed: false,
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    resource: String,
    token: u64,
    closed: bool,
}

impl ChannelHandle for MemoryChannel {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.state.lock();
        if state
            .open
            .get(&self.resource)
            .is_some_and(|(token, _, _)| *token == self.token)
        {
            state.open.remove(&self.resource);
        }
        state.closed_total += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_sink(resource: &str) -> ChannelSink {
        ChannelSink::new(Weak::new(), resource, 1)
    }

    #[test]
    fn test_channel_status_predicates() {
        assert!(ChannelStatus::Subscribed.is_connected());
        assert!(!ChannelStatus::Connecting.is_connected());
        assert!(ChannelStatus::TimedOut.is_failure());
        assert!(ChannelStatus::Errored("boom".into()).is_failure());
        assert_eq!(ChannelStatus::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_memory_transport_open_close() {
        let transport = MemoryTransport::new();
        let spec = ChannelSpec {
            name: "hub-calls".into(),
            resource: "calls".into(),
        };

        let mut handle = transport.open(&spec, detached_sink("calls")).unwrap();
        assert!(transport.is_open("calls"));
        assert_eq!(transport.channel_name("calls").as_deref(), Some("hub-calls"));
        assert!(transport.open(&spec, detached_sink("calls")).is_err());

        handle.close().unwrap();
        handle.close().unwrap();
        assert!(!transport.is_open("calls"));
        assert_eq!(transport.opened_total(), 1);
        assert_eq!(transport.closed_total(), 1);
    }

    #[test]
    fn test_memory_transport_failure_injection() {
        let transport = MemoryTransport::new();
        let spec = ChannelSpec {
            name: "hub-calls".into(),
            resource: "calls".into(),
        };

        transport.fail_next_opens(1);
        assert!(transport.open(&spec, detached_sink("calls")).is_err());
        assert!(transport.open(&spec, detached_sink("calls")).is_ok());
    }

    #[test]
    fn test_detached_sink_drops_events() {
        let sink = detached_sink("calls");
        assert!(!sink.is_live());
        assert!(!sink.deliver(ChangeEvent::insert("calls", serde_json::json!({}))));
    }
}
