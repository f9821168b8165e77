//! Upstream call records and identities.

use core::fmt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::time::Timestamp;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identity from any string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identity as a string slice.
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.into())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque identity of a call.
    CallId
);
string_id!(
    /// Identity of the prospect a call belongs to, used for permission scoping.
    ProspectRef
);
string_id!(
    /// Identity of the viewer owning a reconciliation session.
    ViewerId
);

/// Upstream call status, as written by the telephony pipeline.
///
/// The upstream writes Spanish values (`activa`, `transferida`, ...) as well as
/// English ones; both spellings map to the same variant. Anything else is kept
/// verbatim in `Other`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RawStatus {
    Active,
    Transferred,
    Hungup,
    Lost,
    Completed,
    Successful,
    Other(String),
    /// No status was supplied.
    #[default]
    Unknown,
}

impl RawStatus {
    /// Parses a free-form status string, case-insensitively.
    pub fn parse(text: &str) -> Self {
        let normalized = text.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => RawStatus::Unknown,
            "active" | "activa" => RawStatus::Active,
            "transferred" | "transferida" | "forwarded" => RawStatus::Transferred,
            "hungup" | "hung-up" | "hung_up" | "colgada" => RawStatus::Hungup,
            "lost" | "perdida" => RawStatus::Lost,
            "completed" | "finalizada" => RawStatus::Completed,
            "successful" => RawStatus::Successful,
            _ => RawStatus::Other(text.trim().into()),
        }
    }

    /// Returns the canonical spelling of this status.
    pub fn as_str(&self) -> &str {
        match self {
            RawStatus::Active => "active",
            RawStatus::Transferred => "transferred",
            RawStatus::Hungup => "hungup",
            RawStatus::Lost => "lost",
            RawStatus::Completed => "completed",
            RawStatus::Successful => "successful",
            RawStatus::Other(s) => s,
            RawStatus::Unknown => "",
        }
    }

    /// Returns true for the ACTIVE status.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, RawStatus::Active)
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RawStatus {
    fn from(text: &str) -> Self {
        RawStatus::parse(text)
    }
}

impl Serialize for RawStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RawStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        Ok(text.map(|t| RawStatus::parse(&t)).unwrap_or_default())
    }
}

/// An upstream call record, as delivered by a bulk snapshot or a change event.
///
/// Fields the classifier does not use are kept in `payload` untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCallRecord {
    pub call_id: CallId,
    #[serde(default, alias = "call_status")]
    pub raw_status: RawStatus,
    #[serde(default, alias = "razon_finalizacion")]
    pub end_reason: Option<String>,
    #[serde(default, alias = "duracion_segundos")]
    pub duration_seconds: Option<u64>,
    #[serde(default, alias = "tiene_feedback", deserialize_with = "null_as_false")]
    pub feedback_completed: bool,
    #[serde(default, alias = "fecha_llamada")]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    #[serde(default, alias = "prospecto", alias = "prospecto_id")]
    pub prospect_ref: Option<ProspectRef>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn null_as_false<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

impl RawCallRecord {
    /// Creates a record with the given identity and status, everything else empty.
    pub fn new(call_id: impl Into<CallId>, raw_status: RawStatus, created_at: Timestamp) -> Self {
        Self {
            call_id: call_id.into(),
            raw_status,
            created_at,
            ..Default::default()
        }
    }

    /// Parses a record from a JSON object.
    pub fn from_json(value: &Value) -> Result<Self> {
        let record: RawCallRecord = serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_payload(format!("call record: {}", e)))?;
        if record.call_id.as_str().is_empty() {
            return Err(Error::invalid_payload("call record without call_id"));
        }
        Ok(record)
    }

    /// Returns the end reason if it carries any text.
    #[inline]
    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    /// Returns the duration, treating an absent value as zero.
    #[inline]
    pub fn duration(&self) -> u64 {
        self.duration_seconds.unwrap_or(0)
    }

    /// Returns the last update time, falling back to the creation time.
    #[inline]
    pub fn last_activity(&self) -> Timestamp {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Builder: sets the end reason.
    pub fn with_end_reason(mut self, reason: impl Into<String>) -> Self {
        self.end_reason = Some(reason.into());
        self
    }

    /// Builder: sets the duration.
    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Builder: sets the feedback flag.
    pub fn with_feedback(mut self, completed: bool) -> Self {
        self.feedback_completed = completed;
        self
    }

    /// Builder: sets the update time.
    pub fn with_updated_at(mut self, at: Timestamp) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Builder: sets the prospect reference.
    pub fn with_prospect(mut self, prospect: impl Into<ProspectRef>) -> Self {
        self.prospect_ref = Some(prospect.into());
        self
    }

    /// Builder: sets an opaque payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}
