//! Livecall Hub - Change-feed multiplexing.
//!
//! This crate owns the change-feed channels of a live call session. A single
//! channel per monitored resource is shared by every listener on it:
//!
//! - `event`: change events and event-type filters
//! - `listener`: listener registrations and the routing index
//! - `transport`: the channel transport seam and an in-memory transport
//! - `hub`: [`ChangeFeedHub`], reference-counted channels and fan-out

pub mod event;
pub mod hub;
pub mod listener;
pub mod transport;

pub use event::{ChangeEvent, EventFilter, EventFilterSet, EventType};
pub use hub::{ChangeFeedHub, HubDiagnostics, ResourceDiagnostics, Subscription};
pub use listener::{ListenerCallback, ListenerError, ListenerId, ListenerIndex, ListenerResult};
pub use transport::{ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus, MemoryTransport, Transport};
