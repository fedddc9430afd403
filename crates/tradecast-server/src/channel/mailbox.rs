use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{BroadcastChannel, ChannelError, Publisher, Subscription};

const SUBSCRIBER_QUEUE: usize = 8;

/// Degraded single-slot channel: one file per topic holding the latest
/// message. Subscribers poll and forward content whenever it changes, so a
/// late subscriber sees only the newest value.
#[derive(Clone, Debug)]
pub struct FileMailbox {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileMailbox {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mailbox file for `topic`. Characters outside `[A-Za-z0-9_-]` become `_`.
    pub fn path_for(&self, topic: &str) -> PathBuf {
        let name: String = topic
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    /// Replace the mailbox content atomically (write temp file, then rename).
    async fn write(&self, topic: &str, message: &str) -> Result<(), ChannelError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path_for(topic);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::now_v7()));
        tokio::fs::write(&tmp, message).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

/// `Ok(None)` when the mailbox has never been written.
async fn read_mailbox(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content.trim_end().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl BroadcastChannel for FileMailbox {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn open_publisher(&self) -> Result<Box<dyn Publisher>, ChannelError> {
        Ok(Box::new(MailboxPublisher {
            mailbox: self.clone(),
        }))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        let path = self.path_for(topic);
        let period = self.poll_interval;

        Ok(Subscription::spawn(topic, SUBSCRIBER_QUEUE, move |tx, cancel| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_seen: Option<String> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let content = match read_mailbox(&path).await {
                    Ok(Some(content)) => content,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "mailbox read failed");
                        continue;
                    }
                };
                if last_seen.as_deref() == Some(content.as_str()) {
                    continue;
                }
                trace!(path = %path.display(), bytes = content.len(), "mailbox changed");
                last_seen = Some(content.clone());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(content) => if sent.is_err() { break },
                }
            }
            debug!(path = %path.display(), "mailbox poller stopped");
        }))
    }

    async fn has_state(&self, topic: &str) -> Result<bool, ChannelError> {
        match tokio::fs::metadata(self.path_for(topic)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

struct MailboxPublisher {
    mailbox: FileMailbox,
}

#[async_trait]
impl Publisher for MailboxPublisher {
    async fn publish(&mut self, topic: &str, message: &str) -> Result<(), ChannelError> {
        self.mailbox.write(topic, message).await
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}
