use crate::codec::decode_frames;
use crate::envelope::Envelope;
use crate::errors::StreamError;

/// Largest unterminated frame a buffer will hold before giving up.
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Accumulates raw network chunks and yields envelopes in delimiter order.
///
/// Owned by exactly one connection. Incomplete UTF-8 sequences and
/// unterminated frames are carried over to the next `feed` call, so output
/// is independent of how the byte stream was chunked. Each call only
/// searches the newly arrived text for a delimiter.
#[derive(Debug)]
pub struct StreamBuffer {
    carry: String,
    // carry[..scanned] holds no complete delimiter
    scanned: usize,
    pending_bytes: Vec<u8>,
    max_pending: usize,
    parse_json: bool,
    origin: Option<String>,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StreamBuffer {
    pub fn new(parse_json: bool) -> Self {
        Self {
            carry: String::new(),
            scanned: 0,
            pending_bytes: Vec::new(),
            max_pending: DEFAULT_MAX_PENDING,
            parse_json,
            origin: None,
        }
    }

    /// Stamp every envelope produced by this buffer with `origin`.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Cap on bytes held for a single unterminated frame.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Feed one chunk and return the envelopes it completed.
    ///
    /// Fails with [`StreamError::FrameTooLarge`] once the unterminated tail
    /// outgrows the cap; the carry is dropped so the buffer can be reused.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, StreamError> {
        self.pending_bytes.extend_from_slice(chunk);
        let text = self.drain_utf8();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        self.append(&text);

        // A delimiter can start one byte before the unscanned region, and that
        // byte may be inside a multi-byte character.
        let from = self.scanned.saturating_sub(1);
        let last = self.carry.as_bytes()[from..]
            .windows(2)
            .rposition(|pair| pair == b"\n\n");
        let Some(at) = last.map(|i| from + i) else {
            self.scanned = self.carry.len();
            return self.check_pending().map(|()| Vec::new());
        };

        let tail = self.carry.split_off(at + 2);
        let (frames, remainder) = decode_frames(&self.carry);
        self.carry = remainder + &tail;
        self.scanned = self.carry.len();
        self.check_pending()?;

        Ok(frames
            .into_iter()
            .map(|frame| Envelope::from_frame(frame, self.parse_json, self.origin.as_deref()))
            .collect())
    }

    /// Bytes held back waiting for a delimiter or the rest of a UTF-8 sequence.
    pub fn pending_len(&self) -> usize {
        self.carry.len() + self.pending_bytes.len()
    }

    /// Drop all carry-over. Used when a new connection replaces the old one.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.scanned = 0;
        self.pending_bytes.clear();
    }

    /// Append decoded text, folding CRLF to LF in the new region only. A CR
    /// left at the end of the previous chunk is revisited.
    fn append(&mut self, text: &str) {
        let start = if self.carry.ends_with('\r') {
            self.carry.len() - 1
        } else {
            self.carry.len()
        };
        self.carry.push_str(text);
        if self.carry[start..].contains("\r\n") {
            let folded = self.carry[start..].replace("\r\n", "\n");
            self.carry.truncate(start);
            self.carry.push_str(&folded);
        }
        self.scanned = self.scanned.min(start);
    }

    fn check_pending(&mut self) -> Result<(), StreamError> {
        if self.pending_len() <= self.max_pending {
            return Ok(());
        }
        let held = self.pending_len();
        self.reset();
        Err(StreamError::FrameTooLarge {
            held,
            limit: self.max_pending,
        })
    }

    /// Decode as much of `pending_bytes` as forms complete UTF-8.
    /// Invalid sequences become U+FFFD; a truncated trailing sequence stays pending.
    fn drain_utf8(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending_bytes.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + bad);
                        }
                        None => {
                            self.pending_bytes.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Compare everything except the receive timestamp.
    fn strip(envs: Vec<Envelope>) -> Vec<(Option<String>, String, String, Option<Value>)> {
        envs.into_iter()
            .map(|e| (e.id, e.event_type, e.data, e.parsed))
            .collect()
    }

    const STREAM: &str = "event: data\ndata: {\"symbol\":\"BTCUSDT\"}\n\n\
                          : keep-alive\n\n\
                          id: 2\r\nevent: data\r\n\
                          data: \"{\\\"symbol\\\":\\\"ETHUSDT\\\"}\"\r\n\r\n\
                          data: line one\ndata: line two\n\n\
                          event: error\ndata: {\"message\":\"résumé ✓\"}\n\n\
                          event: no_data\ndata: {}\n\n";

    #[test]
    fn btcusdt_scenario() {
        let mut buffer = StreamBuffer::new(true);
        let envs = buffer.feed(b"event: data\ndata: {\"symbol\":\"BTCUSDT\"}\n\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].event_type, "data");
        assert_eq!(envs[0].data, r#"{"symbol":"BTCUSDT"}"#);
        assert_eq!(envs[0].parsed, Some(json!({"symbol": "BTCUSDT"})));
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let mut whole = StreamBuffer::new(true);
        let expected = strip(whole.feed(STREAM.as_bytes()).unwrap());
        assert_eq!(expected.len(), 5);

        let mut bytewise = StreamBuffer::new(true);
        let mut got = Vec::new();
        for byte in STREAM.as_bytes() {
            got.extend(bytewise.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(strip(got), expected);
    }

    #[test]
    fn arbitrary_split_points_match_single_chunk() {
        let bytes = STREAM.as_bytes();
        let mut whole = StreamBuffer::new(true);
        let expected = strip(whole.feed(bytes).unwrap());

        for split in 0..bytes.len() {
            let mut buffer = StreamBuffer::new(true);
            let mut got = buffer.feed(&bytes[..split]).unwrap();
            got.extend(buffer.feed(&bytes[split..]).unwrap());
            assert_eq!(strip(got), expected, "split at {split}");
        }
    }

    #[test]
    fn partial_frame_is_held_until_delimiter() {
        let mut buffer = StreamBuffer::new(true);
        assert!(buffer.feed(b"event: data\ndata: {\"sym").unwrap().is_empty());
        assert!(buffer.feed(b"bol\":\"SOL\"}\n").unwrap().is_empty());
        assert!(buffer.pending_len() > 0);

        let envs = buffer.feed(b"\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].parsed, Some(json!({"symbol": "SOL"})));
    }

    #[test]
    fn split_multibyte_character() {
        let text = "data: ✓\n\n".as_bytes();
        let mut buffer = StreamBuffer::new(false);
        // ✓ is three bytes; cut inside it
        let cut = text.iter().position(|b| *b == 0xE2).unwrap() + 1;
        assert!(buffer.feed(&text[..cut]).unwrap().is_empty());
        let envs = buffer.feed(&text[cut..]).unwrap();
        assert_eq!(envs[0].data, "✓");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut buffer = StreamBuffer::new(true);
        let envs = buffer.feed(b"data: a\xFFb\n\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].data, "a\u{FFFD}b");
        assert!(envs[0].parsed.is_none());
    }

    #[test]
    fn double_encoded_payload_matches_single() {
        let mut buffer = StreamBuffer::new(true);
        let envs = buffer.feed(STREAM.as_bytes()).unwrap();
        assert_eq!(envs[1].id.as_deref(), Some("2"));
        assert_eq!(envs[1].parsed, Some(json!({"symbol": "ETHUSDT"})));
    }

    #[test]
    fn parse_json_disabled_keeps_raw_text_only() {
        let mut buffer = StreamBuffer::new(false);
        let envs = buffer.feed(b"event: data\ndata: {}\n\n").unwrap();
        assert!(envs[0].parsed.is_none());
        assert_eq!(envs[0].data, "{}");
    }

    #[test]
    fn reset_discards_carry_over() {
        let mut buffer = StreamBuffer::new(true);
        buffer.feed(b"event: data\ndata: half").unwrap();
        buffer.reset();
        assert_eq!(buffer.pending_len(), 0);
        let envs = buffer.feed(b"data: fresh\n\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].data, "fresh");
        assert_eq!(envs[0].event_type, "message");
    }

    #[test]
    fn origin_is_stamped() {
        let mut buffer = StreamBuffer::new(true).with_origin("http://127.0.0.1:3000");
        let envs = buffer.feed(b"data: {}\n\n").unwrap();
        assert_eq!(envs[0].origin.as_deref(), Some("http://127.0.0.1:3000"));
    }

    #[test]
    fn crlf_split_across_chunks() {
        let mut buffer = StreamBuffer::new(false);
        assert!(buffer.feed(b"data: a\r\n\r").unwrap().is_empty());
        let envs = buffer.feed(b"\ndata: b\r").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].data, "a");
        let envs = buffer.feed(b"\n\n").unwrap();
        assert_eq!(envs[0].data, "b");
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn delimiter_after_multibyte_character() {
        let mut buffer = StreamBuffer::new(false);
        assert!(buffer.feed("data: ✓".as_bytes()).unwrap().is_empty());
        let envs = buffer.feed(b"\n\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].data, "✓");
    }

    #[test]
    fn oversized_frame_is_rejected_and_buffer_recovers() {
        let mut buffer = StreamBuffer::new(false).with_max_pending(64);
        let line = format!("data: {}\n", "x".repeat(40));
        assert!(buffer.feed(line.as_bytes()).unwrap().is_empty());

        let err = buffer.feed(line.as_bytes()).unwrap_err();
        assert!(matches!(err, StreamError::FrameTooLarge { limit: 64, .. }), "{err}");
        assert_eq!(buffer.pending_len(), 0);

        let envs = buffer.feed(b"data: next\n\n").unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].data, "next");
    }

    #[test]
    fn long_unterminated_run_stays_bounded() {
        let mut buffer = StreamBuffer::new(false).with_max_pending(1024);
        let mut rejected = 0;
        for _ in 0..1000 {
            if buffer.feed(b"data: chunk\n").is_err() {
                rejected += 1;
            }
            assert!(buffer.pending_len() <= 1024);
        }
        assert!(rejected > 0);
    }

    #[test]
    fn frames_completed_within_one_chunk_do_not_count_toward_cap() {
        let mut buffer = StreamBuffer::new(false).with_max_pending(16);
        let frames = "data: 0123456789\n\n".repeat(20);
        let envs = buffer.feed(frames.as_bytes()).unwrap();
        assert_eq!(envs.len(), 20);
        assert_eq!(buffer.pending_len(), 0);
    }
}
