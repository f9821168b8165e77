//! Livecall Core - Call records, classification and configuration for live
//! call-state synchronization.
//!
//! This crate provides the foundational types shared by the change-feed hub
//! and the reconciliation store:
//!
//! - `RawCallRecord`: An upstream call record with opaque business payload
//! - `CallPatch`: A typed partial update distinguishing absent from null fields
//! - `classify`: Pure classifier from raw record to `CanonicalState`
//! - `SyncConfig`: Session tunables (grace period, debounce, staleness)
//! - `Clock`: Injectable time source (`SystemClock`, `ManualClock`)
//! - `Error`: Error types shared across the workspace
//!
//! # Example
//!
//! ```rust
//! use livecall_core::{classify, CanonicalState, RawCallRecord, RawStatus, Timestamp};
//!
//! // Upstream still says "active" but the call was already forwarded
//! let record = RawCallRecord::new("call-1", RawStatus::Active, Timestamp::EPOCH)
//!     .with_end_reason("forwarded")
//!     .with_duration(340);
//!
//! let c = classify(&record);
//! assert_eq!(c.state, CanonicalState::Transferred);
//! assert!(c.needs_feedback);
//! ```

pub mod classify;
pub mod config;
mod error;
pub mod patch;
pub mod record;
pub mod time;

pub use classify::{classify, summarize, CanonicalState, Classification, ClassificationSummary, ClassifiedCall};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use patch::{CallPatch, Patch};
pub use record::{CallId, ProspectRef, RawCallRecord, RawStatus, ViewerId};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
