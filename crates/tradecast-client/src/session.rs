//! Reconnecting client session.
//!
//! One [`SseSession`] owns at most one physical stream at a time. A spawned
//! driver task runs the connection state machine:
//!
//! ```text
//! Idle ──start──▶ Connecting ──open──▶ Open ──EOF──▶ Closed
//!                    ▲  │                │
//!                    │  └──error──▶ Failed ◀──error──┘
//!                    └──delay───────┘  │
//!                                      └──attempts exhausted──▶ Closed
//! ```
//!
//! `stop()` moves any state to `Closed`. Every driver transition first checks
//! the session's cancellation token under the state lock, so a late transport
//! error can never overwrite a stop.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tradecast_core::codec::{EVENT_ERROR, EVENT_NO_DATA};
use tradecast_core::{
    AnalysisOutcome, AnalysisResult, Envelope, SessionId, StreamBuffer, StreamError,
};

use crate::backoff::ReconnectPolicy;
use crate::error::{validate_url, ClientError};
use crate::history::History;
use crate::options::SessionOptions;
use crate::transport::{ByteStream, Connector, HttpConnector};

/// Status shown before anything has arrived.
pub const WAITING_STATUS: &str = "Waiting for data...";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

type OpenHandler = Arc<dyn Fn() + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Optional callbacks, invoked on the driver task.
#[derive(Clone, Default)]
pub struct SessionHandlers {
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
}

impl SessionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// State written only by the driver (and cleared by `reset`).
struct Shared {
    state: watch::Sender<ConnectionState>,
    history: Mutex<History>,
    last_event: Mutex<Option<Envelope>>,
    last_event_id: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SseSession {
    id: SessionId,
    url: String,
    options: Arc<SessionOptions>,
    handlers: SessionHandlers,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl SseSession {
    /// Create a session over HTTP. Starts immediately when
    /// `options.start_on_create` is set; that fails with
    /// [`ClientError::NoRuntime`] outside a tokio runtime.
    pub fn new(
        url: impl Into<String>,
        options: SessionOptions,
        handlers: SessionHandlers,
    ) -> Result<Self, ClientError> {
        let connector = Arc::new(HttpConnector::new()?);
        Self::with_connector(url, options, handlers, connector)
    }

    pub fn with_connector(
        url: impl Into<String>,
        options: SessionOptions,
        handlers: SessionHandlers,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let url = url.into();
        let _ = validate_url(&url)?;
        if options.start_on_create && Handle::try_current().is_err() {
            return Err(ClientError::NoRuntime);
        }

        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            state,
            history: Mutex::new(History::new(options.max_messages)),
            last_event: Mutex::new(None),
            last_event_id: Mutex::new(None),
            error: Mutex::new(None),
        });

        let start_now = options.start_on_create;
        let session = Self {
            id: SessionId::new(),
            url,
            options: Arc::new(options),
            handlers,
            connector,
            shared,
            driver: Mutex::new(None),
        };
        if start_now {
            session.start();
        }
        Ok(session)
    }

    /// Begin connecting. A no-op while a driver is already running.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            debug!(session_id = %self.id, "start ignored, session already running");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            error!(session_id = %self.id, "cannot start session outside a tokio runtime");
            *self.shared.error.lock() = Some(ClientError::NoRuntime.to_string());
            let _ = self.shared.state.send_replace(ConnectionState::Closed);
            return;
        };

        let cancel = CancellationToken::new();
        let _ = self.shared.state.send_replace(ConnectionState::Connecting);
        let ctx = DriverContext {
            session_id: self.id.clone(),
            url: self.url.clone(),
            options: Arc::clone(&self.options),
            policy: ReconnectPolicy::from_options(&self.options),
            handlers: self.handlers.clone(),
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
            cancel: cancel.clone(),
        };
        info!(session_id = %self.id, url = %self.url, "starting event stream session");
        let task = runtime.spawn(ctx.run());
        *driver = Some(Driver { cancel, task });
    }

    /// Close the stream and cancel any pending reconnect. Idempotent.
    pub fn stop(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.cancel.cancel();
            driver.task.abort();
            info!(session_id = %self.id, "event stream session stopped");
        }
        let _ = self.shared.state.send_replace(ConnectionState::Closed);
    }

    /// Clear history, latest event and error. Connection state is untouched.
    pub fn reset(&self) {
        self.shared.history.lock().clear();
        *self.shared.last_event.lock() = None;
        *self.shared.last_event_id.lock() = None;
        *self.shared.error.lock() = None;
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the session is `Closed`, immediately if it already is.
    /// `Failed` does not count: reconnects may still follow.
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn last_event(&self) -> Option<Envelope> {
        self.shared.last_event.lock().clone()
    }

    /// Snapshot of history, oldest first.
    pub fn messages(&self) -> Vec<Envelope> {
        self.shared.history.lock().snapshot()
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Validated analysis results in history order.
    pub fn results(&self) -> Vec<AnalysisResult> {
        self.shared
            .history
            .lock()
            .iter()
            .filter_map(|env| match AnalysisOutcome::from_envelope(env) {
                AnalysisOutcome::Final(result) => Some(*result),
                AnalysisOutcome::Raw(_) => None,
            })
            .collect()
    }

    /// One-line user-facing status.
    pub fn status_text(&self) -> String {
        if let Some(err) = self.error() {
            return err;
        }
        match self.last_event() {
            None => WAITING_STATUS.to_string(),
            Some(env) if env.is_type(EVENT_NO_DATA) => "No data available".to_string(),
            Some(env) => match AnalysisOutcome::from_envelope(&env) {
                AnalysisOutcome::Final(result) => format!("Result received for {}", result.symbol),
                AnalysisOutcome::Raw(text) => text,
            },
        }
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.cancel.cancel();
            driver.task.abort();
        }
    }
}

enum PumpEnd {
    Eof,
    Cancelled,
    Failed(StreamError),
}

/// Everything the driver task owns.
struct DriverContext {
    session_id: SessionId,
    url: String,
    options: Arc<SessionOptions>,
    policy: ReconnectPolicy,
    handlers: SessionHandlers,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DriverContext {
    async fn run(self) {
        let mut attempts: u32 = 0;
        loop {
            if !self.transition(ConnectionState::Connecting) {
                return;
            }

            let headers = self.options.request_headers();
            let last_event_id = self.shared.last_event_id.lock().clone();
            debug!(
                session_id = %self.session_id,
                url = %self.url,
                attempt = attempts + 1,
                "connecting"
            );

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self
                    .connector
                    .connect(&self.url, &headers, last_event_id.as_deref()) => result,
            };

            let failure = match connected {
                Ok(stream) => {
                    if !self.transition(ConnectionState::Open) {
                        return;
                    }
                    attempts = 0;
                    *self.shared.error.lock() = None;
                    info!(session_id = %self.session_id, "event stream open");
                    if let Some(cb) = &self.handlers.on_open {
                        cb();
                    }

                    match self.pump(stream).await {
                        PumpEnd::Cancelled => return,
                        PumpEnd::Eof => {
                            info!(session_id = %self.session_id, "event stream ended by server");
                            let _ = self.transition(ConnectionState::Closed);
                            return;
                        }
                        PumpEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            attempts += 1;
            if !self.fail(&failure, attempts) {
                return;
            }

            if !self.options.auto_reconnect || attempts >= self.options.max_reconnect_attempts {
                if self.options.auto_reconnect {
                    *self.shared.error.lock() =
                        Some(format!("connection failed after {attempts} attempts: {failure}"));
                }
                error!(
                    session_id = %self.session_id,
                    attempts,
                    error = %failure,
                    "giving up on event stream"
                );
                let _ = self.transition(ConnectionState::Closed);
                return;
            }

            let delay = self.policy.delay(attempts);
            warn!(
                session_id = %self.session_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Read one connection to completion. The decode buffer lives and dies
    /// with this connection.
    async fn pump(&self, mut stream: ByteStream) -> PumpEnd {
        let mut buffer = StreamBuffer::new(self.options.parse_json)
            .with_origin(self.url.as_str())
            .with_max_pending(self.options.max_frame_bytes);
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    trace!(session_id = %self.session_id, bytes = chunk.len(), "chunk received");
                    let envelopes = match buffer.feed(&chunk) {
                        Ok(envelopes) => envelopes,
                        Err(e) => return PumpEnd::Failed(e),
                    };
                    for envelope in envelopes {
                        if !self.deliver(envelope) {
                            return PumpEnd::Cancelled;
                        }
                    }
                }
                Some(Err(e)) => return PumpEnd::Failed(e),
                None => {
                    if buffer.pending_len() > 0 {
                        debug!(
                            session_id = %self.session_id,
                            pending = buffer.pending_len(),
                            "stream ended mid-frame, discarding tail"
                        );
                    }
                    return PumpEnd::Eof;
                }
            }
        }
    }

    fn deliver(&self, envelope: Envelope) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if let Some(id) = &envelope.id {
            *self.shared.last_event_id.lock() = Some(id.clone());
        }
        if !self.options.accepts(&envelope.event_type) {
            trace!(
                session_id = %self.session_id,
                event_type = %envelope.event_type,
                "event type not subscribed"
            );
            return true;
        }

        if envelope.is_type(EVENT_ERROR) {
            let message = envelope
                .parsed
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| envelope.data.clone());
            warn!(session_id = %self.session_id, %message, "relay reported an error");
            *self.shared.error.lock() = Some(message);
        }

        debug!(session_id = %self.session_id, event_type = %envelope.event_type, "event delivered");
        self.shared.history.lock().push(envelope.clone());
        *self.shared.last_event.lock() = Some(envelope.clone());
        if let Some(cb) = &self.handlers.on_message {
            cb(&envelope);
        }
        true
    }

    fn fail(&self, failure: &StreamError, attempt: u32) -> bool {
        if !self.transition(ConnectionState::Failed) {
            return false;
        }
        warn!(
            session_id = %self.session_id,
            error = %failure,
            kind = failure.error_kind(),
            retryable = failure.is_retryable(),
            attempt,
            "event stream failed"
        );
        *self.shared.error.lock() = Some(failure.to_string());
        if let Some(cb) = &self.handlers.on_error {
            cb(failure);
        }
        true
    }

    /// Apply `next` unless the session was stopped. Returns false once stopped.
    fn transition(&self, next: ConnectionState) -> bool {
        let cancel = &self.cancel;
        let mut applied = false;
        let _ = self.shared.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            applied = true;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        applied
    }
}
