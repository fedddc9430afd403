//! Text event-stream framing.
//!
//! A frame is a run of `field: value` lines terminated by a blank line:
//!
//! ```text
//! event: data
//! id: 42
//! data: {"symbol":"BTCUSDT"}
//!
//! ```
//!
//! Decoding is incremental: [`decode_frames`] returns every complete frame in
//! the buffer plus the unterminated tail, which the caller must prepend to
//! the next chunk. A network write can split a frame at any byte, so the
//! tail is never parsed on its own.

use bytes::Bytes;

/// Event type assumed when a frame carries no `event:` line.
pub const DEFAULT_EVENT_TYPE: &str = "message";
/// Relay frame carrying a published payload.
pub const EVENT_DATA: &str = "data";
/// Relay frame carrying `{"message": ...}` before the stream terminates.
pub const EVENT_ERROR: &str = "error";
/// Relay frame sent when the topic has no backing state yet.
pub const EVENT_NO_DATA: &str = "no_data";

const FRAME_DELIMITER: &str = "\n\n";

/// One decoded wire frame, before payload interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub event_type: String,
    pub id: Option<String>,
    pub data: Vec<String>,
}

impl RawFrame {
    /// Data lines joined in arrival order.
    pub fn joined_data(&self) -> String {
        self.data.join("\n")
    }
}

/// Split `buffer` into complete frames and the unterminated remainder.
///
/// CRLF is normalised to LF before splitting. Comment lines (`:`) and
/// unknown fields are skipped. Segments without any `data:` line produce no
/// frame.
pub fn decode_frames(buffer: &str) -> (Vec<RawFrame>, String) {
    let normalized = buffer.replace("\r\n", "\n");
    let mut segments: Vec<&str> = normalized.split(FRAME_DELIMITER).collect();
    // split() always yields at least one segment
    let remainder = segments.pop().map(str::to_owned).unwrap_or_default();

    let frames = segments.into_iter().filter_map(parse_frame).collect();
    (frames, remainder)
}

fn parse_frame(segment: &str) -> Option<RawFrame> {
    let mut event_type: Option<String> = None;
    let mut id = None;
    let mut data = Vec::new();

    for line in segment.split('\n') {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim();
            event_type = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim().to_string());
        }
    }

    if data.is_empty() {
        return None;
    }

    Some(RawFrame {
        event_type: event_type.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
        id,
        data,
    })
}

/// Encode one frame.
///
/// Line breaks inside `data` become additional `data:` lines, so a payload
/// can never smuggle a blank line (frame terminator) onto the wire.
pub fn encode_frame(event_type: &str, data: &str) -> String {
    let event_type: String = event_type.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let data = data.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(event_type.len() + data.len() + 16);
    out.push_str("event: ");
    out.push_str(&event_type);
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Encode a comment frame. Decoders skip it; relays use it as a keep-alive.
pub fn encode_comment(text: &str) -> String {
    let text: String = text.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    format!(": {text}\n\n")
}

/// An outbound frame owned by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    event_type: String,
    payload: String,
}

impl Frame {
    pub fn new(event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    pub fn data(payload: impl Into<String>) -> Self {
        Self::new(EVENT_DATA, payload)
    }

    pub fn error(message: &str) -> Self {
        Self::new(EVENT_ERROR, serde_json::json!({ "message": message }).to_string())
    }

    pub fn no_data() -> Self {
        Self::new(EVENT_NO_DATA, "{}")
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn encode(&self) -> String {
        encode_frame(&self.event_type, &self.payload)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame() {
        let (frames, rest) = decode_frames("event: data\ndata: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type, "data");
        assert_eq!(frames[0].joined_data(), "{\"a\":1}");
        assert!(frames[0].id.is_none());
        assert_eq!(rest, "");
    }

    #[test]
    fn keeps_unterminated_tail() {
        let (frames, rest) = decode_frames("event: data\ndata: one\n\nevent: data\ndata: tw");
        assert_eq!(frames.len(), 1);
        assert_eq!(rest, "event: data\ndata: tw");
    }

    #[test]
    fn joins_multi_line_data_in_order() {
        let (frames, _) = decode_frames("data: first\ndata: second\ndata: third\n\n");
        assert_eq!(frames[0].joined_data(), "first\nsecond\nthird");
        assert_eq!(frames[0].event_type, DEFAULT_EVENT_TYPE);
    }

    #[test]
    fn normalises_crlf() {
        let (frames, rest) = decode_frames("event: ping\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type, "ping");
        assert_eq!(frames[0].joined_data(), "x");
        assert_eq!(rest, "");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let (frames, _) = decode_frames(": keep-alive\n\nretry: 3000\nfoo: bar\ndata: ok\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].joined_data(), "ok");
    }

    #[test]
    fn reads_id_field() {
        let (frames, _) = decode_frames("id: 7\nevent: data\ndata: {}\n\n");
        assert_eq!(frames[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn blank_event_type_falls_back_to_default() {
        let (frames, _) = decode_frames("event:   \ndata: x\n\n");
        assert_eq!(frames[0].event_type, DEFAULT_EVENT_TYPE);
    }

    #[test]
    fn extra_blank_lines_produce_no_frames() {
        let (frames, rest) = decode_frames("\n\n\n\n");
        assert!(frames.is_empty());
        assert_eq!(rest, "");
    }

    #[test]
    fn encode_single_line() {
        assert_eq!(encode_frame("data", "{}"), "event: data\ndata: {}\n\n");
    }

    #[test]
    fn encode_splits_embedded_newlines() {
        let encoded = encode_frame("data", "line one\n\nline three");
        assert_eq!(encoded, "event: data\ndata: line one\ndata: \ndata: line three\n\n");
        // exactly one terminator
        assert_eq!(encoded.matches("\n\n").count(), 1);

        let (frames, rest) = decode_frames(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].joined_data(), "line one\n\nline three");
        assert_eq!(rest, "");
    }

    #[test]
    fn encode_strips_newlines_from_event_type() {
        assert_eq!(encode_frame("da\nta", "x"), "event: data\ndata: x\n\n");
    }

    #[test]
    fn comment_decodes_to_nothing() {
        let (frames, rest) = decode_frames(&encode_comment("keep-alive"));
        assert!(frames.is_empty());
        assert_eq!(rest, "");
    }

    #[test]
    fn relay_frames() {
        assert_eq!(Frame::no_data().encode(), "event: no_data\ndata: {}\n\n");
        assert_eq!(
            Frame::error("redis down").encode(),
            "event: error\ndata: {\"message\":\"redis down\"}\n\n"
        );
    }
}
