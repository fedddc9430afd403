use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::{BroadcastChannel, ChannelError, Publisher, Subscription};

const DEFAULT_TOPIC_CAPACITY: usize = 256;
const DEFAULT_SUBSCRIBER_QUEUE: usize = 64;

struct Topic {
    tx: broadcast::Sender<String>,
    published: bool,
}

struct Hub {
    topics: DashMap<String, Topic>,
    capacity: usize,
}

impl Hub {
    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                tx: broadcast::channel(self.capacity).0,
                published: false,
            })
            .tx
            .clone()
    }

    /// Returns the number of subscribers that will see the message.
    fn publish(&self, topic: &str, message: String) -> usize {
        let mut entry = self.topics.entry(topic.to_string()).or_insert_with(|| Topic {
            tx: broadcast::channel(self.capacity).0,
            published: false,
        });
        entry.published = true;
        // No receivers is not an error: delivery is at-most-once.
        entry.tx.send(message).unwrap_or(0)
    }
}

/// In-process broadcast hub. One `tokio::sync::broadcast` per topic.
#[derive(Clone)]
pub struct MemoryChannel {
    hub: Arc<Hub>,
    subscriber_queue: usize,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE)
    }
}

impl MemoryChannel {
    pub fn new(topic_capacity: usize, subscriber_queue: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                topics: DashMap::new(),
                capacity: topic_capacity.max(1),
            }),
            subscriber_queue,
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub
            .topics
            .get(topic)
            .map(|t| t.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BroadcastChannel for MemoryChannel {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_publisher(&self) -> Result<Box<dyn Publisher>, ChannelError> {
        Ok(Box::new(MemoryPublisher {
            hub: Arc::clone(&self.hub),
        }))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        let mut rx = self.hub.sender(topic).subscribe();
        let topic_name = topic.to_string();

        Ok(Subscription::spawn(topic, self.subscriber_queue, move |tx, cancel| async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(message) => {
                        trace!(topic = %topic_name, bytes = message.len(), "forwarding message");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(message) => if sent.is_err() { break },
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            topic = %topic_name,
                            skipped = n,
                            "subscriber lagged, dropped messages"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic_name, "topic closed");
                        break;
                    }
                }
            }
        }))
    }

    async fn has_state(&self, topic: &str) -> Result<bool, ChannelError> {
        Ok(self.hub.topics.get(topic).is_some_and(|t| t.published))
    }
}

struct MemoryPublisher {
    hub: Arc<Hub>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&mut self, topic: &str, message: &str) -> Result<(), ChannelError> {
        let receivers = self.hub.publish(topic, message.to_string());
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}
