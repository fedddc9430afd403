use std::time::Duration;

use tradecast_core::codec::DEFAULT_EVENT_TYPE;
use tradecast_core::DEFAULT_MAX_PENDING;

/// Delay shape between reconnect attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Always wait `reconnect_interval`.
    Fixed,
    /// `reconnect_interval * 2^(attempt-1)`, capped at `max`, spread by `jitter` (0.0..=1.0).
    Exponential { max: Duration, jitter: f64 },
}

/// Client session configuration.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// When false, `Authorization` and `Cookie` headers are never sent.
    pub with_credentials: bool,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Event types delivered in addition to the default `message` type.
    pub event_types: Vec<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    /// Ceiling on consecutive failed attempts, regardless of backoff shape.
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    pub parse_json: bool,
    /// History capacity.
    pub max_messages: usize,
    /// Largest unterminated frame held before the connection is failed.
    pub max_frame_bytes: usize,
    /// Start connecting as soon as the session is created.
    pub start_on_create: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            with_credentials: false,
            headers: Vec::new(),
            event_types: Vec::new(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(1500),
            max_reconnect_attempts: 10,
            backoff: Backoff::Fixed,
            parse_json: true,
            max_messages: 1000,
            max_frame_bytes: DEFAULT_MAX_PENDING,
            start_on_create: true,
        }
    }
}

impl SessionOptions {
    /// Whether envelopes of `event_type` reach history and `on_message`.
    pub fn accepts(&self, event_type: &str) -> bool {
        event_type == DEFAULT_EVENT_TYPE || self.event_types.iter().any(|t| t == event_type)
    }

    /// Headers to send, with credential headers removed unless allowed.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| self.with_credentials || !is_credential_header(name))
            .cloned()
            .collect()
    }
}

fn is_credential_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("cookie")
}
