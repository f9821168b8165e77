//! Live transcript entries attached to active calls.

use livecall_core::Timestamp;
use serde::{Deserialize, Serialize};

/// Who spoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

/// One line of a live transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(rename = "role")]
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(default, rename = "secondsFromStart", skip_serializing_if = "Option::is_none")]
    pub seconds_from_start: Option<f64>,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, content: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            speaker,
            content: content.into(),
            timestamp,
            seconds_from_start: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcript_entry_from_upstream_json() {
        let entry: TranscriptEntry = serde_json::from_value(json!({
            "role": "assistant",
            "content": "Hola, le llamo de parte del resort",
            "timestamp": "1970-01-01T00:00:05Z",
            "secondsFromStart": 4.5
        }))
        .unwrap();

        assert_eq!(entry.speaker, Speaker::Assistant);
        assert_eq!(entry.timestamp, Timestamp::from_millis(5_000));
        assert_eq!(entry.seconds_from_start, Some(4.5));
    }
}
