//! Broadcast channel abstraction.
//!
//! Delivery is at-most-once per subscriber and in publish order. A
//! [`Subscription`] owns its forwarder task and must be released with
//! [`Subscription::disconnect`]; dropping it unreleased only cancels.

mod mailbox;
mod memory;

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tradecast_core::{StreamError, SubscriptionId};

pub use mailbox::FileMailbox;
pub use memory::MemoryChannel;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("subscribe to {topic:?} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic:?} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("channel connection failed: {0}")]
    Connect(String),
    #[error("subscription release failed: {0}")]
    Release(String),
    #[error("channel io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for StreamError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Publish { .. } => StreamError::Publish(err.to_string()),
            other => StreamError::SubscriptionSetup(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Short backend name for health output and logs.
    fn name(&self) -> &'static str;

    /// Open a scoped publisher connection.
    async fn open_publisher(&self) -> Result<Box<dyn Publisher>, ChannelError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError>;

    /// Whether the topic has ever carried a message.
    async fn has_state(&self, topic: &str) -> Result<bool, ChannelError>;
}

#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, topic: &str, message: &str) -> Result<(), ChannelError>;

    /// Close the connection. Called on every exit path.
    async fn disconnect(self: Box<Self>) -> Result<(), ChannelError>;
}

/// A live subscription. Messages arrive on a bounded queue filled by a
/// backend-specific forwarder task.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawn `forwarder` and wrap it. The forwarder must return once the
    /// token is cancelled or its sender is closed.
    pub fn spawn<F, Fut>(topic: &str, queue: usize, forwarder: F) -> Self
    where
        F: FnOnce(mpsc::Sender<String>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forwarder(tx, cancel.clone()));
        Self {
            id: SubscriptionId::new(),
            topic: topic.to_string(),
            rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_released(&self) -> bool {
        self.task.is_none()
    }

    /// Next message, or `None` once the backend stopped forwarding.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop forwarding and wait for the forwarder to exit. Idempotent.
    pub async fn disconnect(&mut self) -> Result<(), ChannelError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.cancel.cancel();
        self.rx.close();
        match task.await {
            Ok(()) => {
                debug!(subscription_id = %self.id, topic = %self.topic, "subscription released");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ChannelError::Release(e.to_string())),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}
