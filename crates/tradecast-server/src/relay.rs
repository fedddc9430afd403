//! Relay server session: one per inbound streaming request.
//!
//! The relay checks that the topic has state, subscribes, then forwards each
//! published message as a `data` frame until the client goes away or the
//! channel ends. Setup failures produce exactly one `error` frame. The
//! subscription is released exactly once on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tradecast_core::{Frame, SessionId, StreamError};

use crate::channel::{BroadcastChannel, Subscription};
use crate::registry::RelayRegistry;
use crate::sink::{FrameSink, RelayBody};

const CHANNEL_CLOSED_MESSAGE: &str = "broadcast channel closed";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub topic: String,
    /// Comment frame interval. `None` disables keep-alives.
    pub keep_alive: Option<Duration>,
    /// Encoded frames buffered ahead of the client.
    pub send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "analysis_results".into(),
            keep_alive: Some(Duration::from_secs(15)),
            send_queue: 64,
        }
    }
}

/// Why a relay ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    NoData,
    SetupFailed,
    ChannelClosed,
    ClientGone,
    Cancelled,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::SetupFailed => "setup_failed",
            Self::ChannelClosed => "channel_closed",
            Self::ClientGone => "client_gone",
            Self::Cancelled => "cancelled",
        }
    }
}

enum Step {
    Cancelled,
    Message(Option<String>),
    KeepAlive,
}

pub struct RelaySession {
    id: SessionId,
    channel: Arc<dyn BroadcastChannel>,
    config: RelayConfig,
    sink: FrameSink,
    cancel: CancellationToken,
    subscription: Option<Subscription>,
    registry: Option<Arc<RelayRegistry>>,
}

impl RelaySession {
    /// Create a relay and the response body it writes into. Dropping the body
    /// cancels the relay.
    pub fn open(channel: Arc<dyn BroadcastChannel>, config: RelayConfig) -> (Self, RelayBody) {
        Self::open_with_cancel(channel, config, CancellationToken::new())
    }

    /// Like [`RelaySession::open`], but the relay also stops when `parent`
    /// is cancelled (server shutdown).
    pub fn open_child(
        channel: Arc<dyn BroadcastChannel>,
        config: RelayConfig,
        parent: &CancellationToken,
    ) -> (Self, RelayBody) {
        Self::open_with_cancel(channel, config, parent.child_token())
    }

    fn open_with_cancel(
        channel: Arc<dyn BroadcastChannel>,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> (Self, RelayBody) {
        let (sink, rx) = FrameSink::channel(config.send_queue);
        let body = RelayBody::new(rx, cancel.clone().drop_guard());
        let session = Self {
            id: SessionId::new(),
            channel,
            config,
            sink,
            cancel,
            subscription: None,
            registry: None,
        };
        (session, body)
    }

    pub fn with_registry(mut self, registry: Arc<RelayRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Token cancelled when the response body is dropped. Cancelling it
    /// externally stops the relay too.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> RelayOutcome {
        let _ticket = self
            .registry
            .as_ref()
            .map(|r| r.register(self.id.clone(), &self.config.topic));
        info!(
            session_id = %self.id,
            topic = %self.config.topic,
            channel = self.channel.name(),
            "relay opened"
        );

        let outcome = self.drive().await;
        self.release().await;
        let _ = self.sink.close();

        info!(
            session_id = %self.id,
            outcome = outcome.as_str(),
            frames = self.sink.frames_written(),
            "relay closed"
        );
        outcome
    }

    async fn drive(&mut self) -> RelayOutcome {
        let topic = self.config.topic.clone();

        let has_state = tokio::select! {
            _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
            result = self.channel.has_state(&topic) => result,
        };
        match has_state {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %self.id, topic = %topic, "topic has no state");
                self.terminal(Frame::no_data()).await;
                return RelayOutcome::NoData;
            }
            Err(e) => {
                let err = StreamError::from(e);
                warn!(
                    session_id = %self.id,
                    topic = %topic,
                    kind = err.error_kind(),
                    error = %err,
                    "state check failed"
                );
                self.terminal(Frame::error(&err.to_string())).await;
                return RelayOutcome::SetupFailed;
            }
        }

        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
            result = self.channel.subscribe(&topic) => result,
        };
        match subscribed {
            Ok(sub) => {
                debug!(session_id = %self.id, subscription_id = %sub.id(), "subscribed");
                self.subscription = Some(sub);
            }
            Err(e) => {
                let err = StreamError::from(e);
                warn!(
                    session_id = %self.id,
                    topic = %topic,
                    kind = err.error_kind(),
                    error = %err,
                    "subscribe failed"
                );
                self.terminal(Frame::error(&err.to_string())).await;
                return RelayOutcome::SetupFailed;
            }
        }

        let mut keep_alive = self.config.keep_alive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let Some(sub) = self.subscription.as_mut() else {
                return RelayOutcome::ChannelClosed;
            };
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                message = sub.recv() => Step::Message(message),
                _ = tick(&mut keep_alive) => Step::KeepAlive,
            };

            match step {
                Step::Cancelled => return RelayOutcome::Cancelled,
                Step::Message(Some(text)) => {
                    trace!(session_id = %self.id, bytes = text.len(), "relaying message");
                    if let Err(e) = self.sink.send(&Frame::data(text)).await {
                        self.client_gone(e.into());
                        return RelayOutcome::ClientGone;
                    }
                }
                Step::Message(None) => {
                    warn!(session_id = %self.id, topic = %topic, "subscription ended by channel");
                    self.terminal(Frame::error(CHANNEL_CLOSED_MESSAGE)).await;
                    return RelayOutcome::ChannelClosed;
                }
                Step::KeepAlive => {
                    if let Err(e) = self.sink.comment("keep-alive").await {
                        self.client_gone(e.into());
                        return RelayOutcome::ClientGone;
                    }
                }
            }
        }
    }

    /// A failed write means the client went away; it ends the relay quietly.
    fn client_gone(&self, err: StreamError) {
        debug!(session_id = %self.id, kind = err.error_kind(), error = %err, "client gone");
    }

    /// Write a final frame and close. Only the first close reaches the client.
    async fn terminal(&mut self, frame: Frame) {
        if let Err(e) = self.sink.send(&frame).await {
            debug!(
                session_id = %self.id,
                event_type = frame.event_type(),
                error = %e,
                "terminal frame not delivered"
            );
        }
        let _ = self.sink.close();
    }

    async fn release(&mut self) {
        let Some(mut sub) = self.subscription.take() else {
            return;
        };
        if let Err(e) = sub.disconnect().await {
            warn!(
                session_id = %self.id,
                subscription_id = %sub.id(),
                error = %e,
                "subscription release failed"
            );
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;

    use tradecast_core::StreamBuffer;

    use super::*;
    use crate::channel::{ChannelError, MemoryChannel, Publisher};

    fn config(topic: &str) -> RelayConfig {
        RelayConfig {
            topic: topic.into(),
            keep_alive: None,
            send_queue: 8,
        }
    }

    async fn read_all(body: RelayBody) -> String {
        let chunks: Vec<Bytes> = body.map(|c| c.unwrap()).collect().await;
        chunks.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect()
    }

    async fn publish(channel: &MemoryChannel, topic: &str, message: &str) {
        let mut publisher = channel.open_publisher().await.unwrap();
        publisher.publish(topic, message).await.unwrap();
        publisher.disconnect().await.unwrap();
    }

    async fn wait_for_subscriber(channel: &MemoryChannel, topic: &str) {
        while channel.subscriber_count(topic) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// State check succeeds; subscribe always fails.
    struct RefusingChannel;

    #[async_trait]
    impl BroadcastChannel for RefusingChannel {
        fn name(&self) -> &'static str {
            "refusing"
        }

        async fn open_publisher(&self) -> Result<Box<dyn Publisher>, ChannelError> {
            Err(ChannelError::Connect("refused".into()))
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
            Err(ChannelError::Subscribe {
                topic: topic.into(),
                reason: "connection refused".into(),
            })
        }

        async fn has_state(&self, _topic: &str) -> Result<bool, ChannelError> {
            Ok(true)
        }
    }

    /// Counts forwarder exits. With `close_immediately` the forwarder ends
    /// right away, as if the backend dropped the subscription.
    struct CountingChannel {
        exits: Arc<AtomicUsize>,
        close_immediately: bool,
    }

    #[async_trait]
    impl BroadcastChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn open_publisher(&self) -> Result<Box<dyn Publisher>, ChannelError> {
            Err(ChannelError::Connect("read only".into()))
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
            let exits = Arc::clone(&self.exits);
            let close_immediately = self.close_immediately;
            Ok(Subscription::spawn(topic, 4, move |tx, cancel| async move {
                // the receiver sees end of stream once this sender drops
                let _tx = tx;
                if !close_immediately {
                    cancel.cancelled().await;
                }
                exits.fetch_add(1, Ordering::SeqCst);
            }))
        }

        async fn has_state(&self, _topic: &str) -> Result<bool, ChannelError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn empty_topic_gets_single_no_data_frame() {
        let channel = Arc::new(MemoryChannel::default());
        let (relay, body) = RelaySession::open(channel, config("t"));
        let handle = tokio::spawn(relay.run());

        assert_eq!(read_all(body).await, "event: no_data\ndata: {}\n\n");
        assert_eq!(handle.await.unwrap(), RelayOutcome::NoData);
    }

    #[tokio::test]
    async fn subscribe_failure_writes_exactly_one_error_frame() {
        let (relay, body) = RelaySession::open(Arc::new(RefusingChannel), config("t"));
        let handle = tokio::spawn(relay.run());

        let text = read_all(body).await;
        let envelopes = StreamBuffer::new(true).feed(text.as_bytes()).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event_type, "error");
        let message = envelopes[0].parsed.as_ref().unwrap()["message"].as_str().unwrap();
        assert!(message.starts_with("subscription setup failed"), "{message}");
        assert!(message.contains("connection refused"), "{message}");
        assert_eq!(handle.await.unwrap(), RelayOutcome::SetupFailed);
    }

    #[tokio::test]
    async fn forwards_messages_then_releases_on_disconnect() {
        let channel = Arc::new(MemoryChannel::default());
        publish(&channel, "t", "{\"seed\":true}").await;

        let registry = Arc::new(RelayRegistry::new());
        let (relay, mut body) = RelaySession::open(channel.clone(), config("t"));
        let handle = tokio::spawn(relay.with_registry(Arc::clone(&registry)).run());

        wait_for_subscriber(&channel, "t").await;
        assert_eq!(registry.count(), 1);

        publish(&channel, "t", r#"{"symbol":"BTCUSDT"}"#).await;
        publish(&channel, "t", "line one\nline two").await;

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("event: data\ndata: {\"symbol\":\"BTCUSDT\"}\n\n"));
        let second = body.next().await.unwrap().unwrap();
        assert_eq!(second, Bytes::from("event: data\ndata: line one\ndata: line two\n\n"));

        drop(body);
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Cancelled | RelayOutcome::ClientGone));
        assert_eq!(channel.subscriber_count("t"), 0);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn subscription_released_exactly_once_on_cancel() {
        let exits = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(CountingChannel {
            exits: Arc::clone(&exits),
            close_immediately: false,
        });
        let (relay, body) = RelaySession::open(channel, config("t"));
        let token = relay.cancel_token();
        let handle = tokio::spawn(relay.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), RelayOutcome::Cancelled);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        // nothing was written before the stream ended
        assert_eq!(read_all(body).await, "");
    }

    #[tokio::test]
    async fn parent_cancellation_stops_relay() {
        let channel = Arc::new(MemoryChannel::default());
        publish(&channel, "t", "{}").await;

        let shutdown = CancellationToken::new();
        let (relay, body) = RelaySession::open_child(channel.clone(), config("t"), &shutdown);
        let handle = tokio::spawn(relay.run());
        wait_for_subscriber(&channel, "t").await;

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), RelayOutcome::Cancelled);
        assert_eq!(read_all(body).await, "");
        assert_eq!(channel.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn channel_end_writes_one_error_frame() {
        let exits = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(CountingChannel {
            exits: Arc::clone(&exits),
            close_immediately: true,
        });
        let (relay, body) = RelaySession::open(channel, config("t"));
        let handle = tokio::spawn(relay.run());

        let text = read_all(body).await;
        assert_eq!(text, Frame::error(CHANNEL_CLOSED_MESSAGE).encode());
        assert_eq!(handle.await.unwrap(), RelayOutcome::ChannelClosed);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_comments_are_sent() {
        let channel = Arc::new(MemoryChannel::default());
        publish(&channel, "t", "{}").await;

        let (relay, mut body) = RelaySession::open(
            channel,
            RelayConfig {
                keep_alive: Some(Duration::from_secs(15)),
                ..config("t")
            },
        );
        let _handle = tokio::spawn(relay.run());

        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from(": keep-alive\n\n"));
    }
}
