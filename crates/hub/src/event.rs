//! Change events delivered by a change feed.
//!
//! The wire shape follows the upstream realtime envelope:
//! `{ "eventType": "UPDATE", "table": "...", "new": {..}, "old": {..}, "commit_timestamp": ".." }`.

use core::fmt;
use livecall_core::{Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of row change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        })
    }
}

/// What a listener wants to hear about. `All` is the `*` wildcard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    All,
}

impl EventFilter {
    /// Parses `INSERT`, `UPDATE`, `DELETE` or `*`, case-insensitively.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventFilter::Insert),
            "UPDATE" => Ok(EventFilter::Update),
            "DELETE" => Ok(EventFilter::Delete),
            "*" => Ok(EventFilter::All),
            other => Err(Error::invalid_payload(format!("unknown event filter {:?}", other))),
        }
    }

    #[inline]
    fn bit(self) -> u8 {
        match self {
            EventFilter::Insert => 0b0001,
            EventFilter::Update => 0b0010,
            EventFilter::Delete => 0b0100,
            EventFilter::All => 0b1000,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Insert => EventFilter::Insert,
            EventType::Update => EventFilter::Update,
            EventType::Delete => EventFilter::Delete,
        }
    }
}

/// A set of event filters held by one listener registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventFilterSet(u8);

impl EventFilterSet {
    /// Builds a set from a list of filters. An empty list means `*`.
    pub fn from_filters(filters: &[EventFilter]) -> Self {
        let bits = filters.iter().fold(0u8, |acc, f| acc | f.bit());
        if bits == 0 {
            Self(EventFilter::All.bit())
        } else {
            Self(bits)
        }
    }

    /// Returns true if the set names `event_type` explicitly.
    #[inline]
    pub fn names(&self, event_type: EventType) -> bool {
        self.0 & EventFilter::from(event_type).bit() != 0
    }

    /// Returns true if the set contains the wildcard.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.0 & EventFilter::All.bit() != 0
    }

    /// Returns true if an event of `event_type` should reach this set.
    #[inline]
    pub fn matches(&self, event_type: EventType) -> bool {
        self.is_wildcard() || self.names(event_type)
    }
}

/// One row change on a monitored resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "table", default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Row after the change. Empty for deletes.
    #[serde(default)]
    pub new: Map<String, Value>,
    /// Row before the change, often only the primary key.
    #[serde(default)]
    pub old: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<Timestamp>,
}

fn into_object(row: Value) -> Map<String, Value> {
    match row {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ChangeEvent {
    /// Creates an event with explicit before/after rows.
    pub fn new(event_type: EventType, resource: impl Into<String>, new: Value, old: Value) -> Self {
        Self {
            event_type,
            resource: resource.into(),
            schema: None,
            new: into_object(new),
            old: into_object(old),
            commit_timestamp: None,
        }
    }

    /// Creates an INSERT event.
    pub fn insert(resource: impl Into<String>, row: Value) -> Self {
        Self::new(EventType::Insert, resource, row, Value::Null)
    }

    /// Creates an UPDATE event.
    pub fn update(resource: impl Into<String>, row: Value) -> Self {
        Self::new(EventType::Update, resource, row, Value::Null)
    }

    /// Creates a DELETE event; `old` identifies the deleted row.
    pub fn delete(resource: impl Into<String>, old: Value) -> Self {
        Self::new(EventType::Delete, resource, Value::Null, old)
    }

    /// Parses the upstream realtime envelope.
    pub fn from_json(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_payload(format!("change event: {}", e)))
    }

    /// Returns the row that identifies the changed record.
    ///
    /// Deletes carry the identity in `old`; inserts and updates in `new`,
    /// falling back to `old` when `new` is empty.
    pub fn row(&self) -> &Map<String, Value> {
        match self.event_type {
            EventType::Delete if !self.old.is_empty() => &self.old,
            EventType::Delete => &self.new,
            _ if self.new.is_empty() => &self.old,
            _ => &self.new,
        }
    }
}
