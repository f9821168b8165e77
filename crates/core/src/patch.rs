//! Typed partial updates for call records.
//!
//! A change event carries only the columns that changed. `Patch<T>` keeps the
//! difference between a field that was not sent (`Absent`) and one that was
//! explicitly cleared (`Null`), so merging an event never clobbers fields the
//! event did not mention.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::record::{CallId, ProspectRef, RawCallRecord, RawStatus};
use crate::time::Timestamp;

/// One field of a partial update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Patch<T> {
    /// The field was not part of the update.
    #[default]
    Absent,
    /// The field was sent as `null`.
    Null,
    /// The field was sent with a value.
    Set(T),
}

impl<T: Clone + PartialEq> Patch<T> {
    /// Returns true if the field was not part of the update.
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }

    /// Returns the value if one was sent.
    #[inline]
    pub fn value(&self) -> Option<&T> {
        match self {
            Patch::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Applies this patch to an optional field. Returns true if the field changed.
    pub fn apply_to(&self, target: &mut Option<T>) -> bool {
        let next = match self {
            Patch::Absent => return false,
            Patch::Null => None,
            Patch::Set(v) => Some(v.clone()),
        };
        if *target == next {
            false
        } else {
            *target = next;
            true
        }
    }

    /// Applies this patch to a required field, resetting to `cleared` on `Null`.
    pub fn apply_or(&self, target: &mut T, cleared: T) -> bool {
        let next = match self {
            Patch::Absent => return false,
            Patch::Null => cleared,
            Patch::Set(v) => v.clone(),
        };
        if *target == next {
            false
        } else {
            *target = next;
            true
        }
    }
}

const CALL_ID_KEYS: &[&str] = &["call_id"];
const STATUS_KEYS: &[&str] = &["raw_status", "call_status"];
const END_REASON_KEYS: &[&str] = &["end_reason", "razon_finalizacion"];
const DURATION_KEYS: &[&str] = &["duration_seconds", "duracion_segundos"];
const FEEDBACK_KEYS: &[&str] = &["feedback_completed", "tiene_feedback"];
const CREATED_KEYS: &[&str] = &["created_at", "fecha_llamada"];
const UPDATED_KEYS: &[&str] = &["updated_at"];
const PROSPECT_KEYS: &[&str] = &["prospect_ref", "prospecto", "prospecto_id"];

fn is_known_key(key: &str) -> bool {
    [
        CALL_ID_KEYS,
        STATUS_KEYS,
        END_REASON_KEYS,
        DURATION_KEYS,
        FEEDBACK_KEYS,
        CREATED_KEYS,
        UPDATED_KEYS,
        PROSPECT_KEYS,
    ]
    .iter()
    .any(|keys| keys.contains(&key))
}

fn field<T: DeserializeOwned>(object: &Map<String, Value>, keys: &[&str]) -> Result<Patch<T>> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|k| object.get(*k).map(|v| (*k, v)))
    else {
        return Ok(Patch::Absent);
    };
    if value.is_null() {
        return Ok(Patch::Null);
    }
    serde_json::from_value(value.clone())
        .map(Patch::Set)
        .map_err(|e| Error::invalid_payload(format!("field {}: {}", key, e)))
}

/// A partial update to one call record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallPatch {
    pub call_id: CallId,
    pub raw_status: Patch<RawStatus>,
    pub end_reason: Patch<String>,
    pub duration_seconds: Patch<u64>,
    pub feedback_completed: Patch<bool>,
    pub created_at: Patch<Timestamp>,
    pub updated_at: Patch<Timestamp>,
    pub prospect_ref: Patch<ProspectRef>,
    /// Opaque fields that were sent; a `null` value clears the field.
    pub payload: Map<String, Value>,
}

impl CallPatch {
    /// Creates an empty patch for a call.
    pub fn new(call_id: impl Into<CallId>) -> Self {
        Self {
            call_id: call_id.into(),
            ..Default::default()
        }
    }

    /// Parses a patch from a (possibly partial) JSON row.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_payload("change row is not an object"))?;

        let call_id = match CALL_ID_KEYS.iter().find_map(|k| object.get(*k)) {
            Some(Value::String(s)) if !s.trim().is_empty() => CallId::new(s.trim()),
            Some(Value::Number(n)) => CallId::new(n.to_string()),
            _ => return Err(Error::invalid_payload("change row without call_id")),
        };

        let raw_status = match field::<Option<String>>(object, STATUS_KEYS)? {
            Patch::Set(Some(s)) => Patch::Set(RawStatus::parse(&s)),
            Patch::Set(None) | Patch::Null => Patch::Null,
            Patch::Absent => Patch::Absent,
        };

        let payload = object
            .iter()
            .filter(|(k, _)| !is_known_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            call_id,
            raw_status,
            end_reason: field(object, END_REASON_KEYS)?,
            duration_seconds: field(object, DURATION_KEYS)?,
            feedback_completed: field(object, FEEDBACK_KEYS)?,
            created_at: field(object, CREATED_KEYS)?,
            updated_at: field(object, UPDATED_KEYS)?,
            prospect_ref: field(object, PROSPECT_KEYS)?,
            payload,
        })
    }

    /// Merges this patch into `record`. Returns true if anything changed.
    ///
    /// The creation time is immutable once known: a `null` creation time is ignored.
    pub fn apply(&self, record: &mut RawCallRecord) -> bool {
        let mut changed = false;
        changed |= self.raw_status.apply_or(&mut record.raw_status, RawStatus::Unknown);
        changed |= self.end_reason.apply_to(&mut record.end_reason);
        changed |= self.duration_seconds.apply_to(&mut record.duration_seconds);
        changed |= self.feedback_completed.apply_or(&mut record.feedback_completed, false);
        if let Patch::Set(at) = self.created_at {
            if record.created_at != at {
                record.created_at = at;
                changed = true;
            }
        }
        changed |= self.updated_at.apply_to(&mut record.updated_at);
        changed |= self.prospect_ref.apply_to(&mut record.prospect_ref);

        for (key, value) in &self.payload {
            if value.is_null() {
                changed |= record.payload.remove(key).is_some();
            } else if record.payload.get(key) != Some(value) {
                record.payload.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Builds a full record from this patch alone, absent fields left empty.
    pub fn to_record(&self) -> RawCallRecord {
        let mut record = RawCallRecord {
            call_id: self.call_id.clone(),
            ..Default::default()
        };
        self.apply(&mut record);
        record
    }

    /// Returns the opaque payload keys carried by this patch.
    pub fn payload_keys(&self) -> impl Iterator<Item = &str> {
        self.payload.keys().map(|k| k.as_str())
    }
}
