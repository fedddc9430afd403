use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::RawFrame;

/// Application-facing form of a decoded frame. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope from a frame, optionally attempting JSON decoding.
    pub fn from_frame(frame: RawFrame, parse_json: bool, origin: Option<&str>) -> Self {
        let data = frame.joined_data();
        let parsed = if parse_json { decode_payload(&data) } else { None };
        Self {
            id: frame.id,
            event_type: frame.event_type,
            data,
            parsed,
            origin: origin.map(str::to_owned),
            received_at: Utc::now(),
        }
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// Decode `raw` as JSON.
///
/// If the result is a JSON string, its contents are decoded once more; on
/// failure the string itself is kept. The unwrap stops after one level.
pub fn decode_payload(raw: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(inner)),
        },
        value => Some(value),
    }
}
