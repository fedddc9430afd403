use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::channel::{BroadcastChannel, ChannelError};

/// Response body of a publish request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PublishOutcome {
    Success,
    Error { message: String },
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),
    #[error("publisher connection failed: {0}")]
    Connect(#[source] ChannelError),
    #[error("publish failed: {0}")]
    Publish(#[source] ChannelError),
}

/// Publishes trigger payloads on one broadcast topic. A publisher
/// connection is opened per call and always disconnected afterwards.
#[derive(Clone)]
pub struct PublishGateway {
    channel: Arc<dyn BroadcastChannel>,
    topic: String,
}

impl PublishGateway {
    pub fn new(channel: Arc<dyn BroadcastChannel>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish and fold any failure into [`PublishOutcome::Error`].
    pub async fn publish(&self, payload: &Value) -> PublishOutcome {
        match self.try_publish(payload).await {
            Ok(()) => PublishOutcome::Success,
            Err(e) => {
                error!(topic = %self.topic, error = %e, "publish failed");
                PublishOutcome::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn try_publish(&self, payload: &Value) -> Result<(), PublishError> {
        if !payload.is_object() {
            return Err(PublishError::InvalidPayload(json_kind(payload)));
        }
        // compact JSON never contains a raw newline
        let message = payload.to_string();

        let mut publisher = self
            .channel
            .open_publisher()
            .await
            .map_err(PublishError::Connect)?;
        let result = publisher.publish(&self.topic, &message).await;
        if let Err(e) = publisher.disconnect().await {
            warn!(topic = %self.topic, error = %e, "publisher disconnect failed");
        }
        result.map_err(PublishError::Publish)?;

        info!(
            topic = %self.topic,
            bytes = message.len(),
            channel = self.channel.name(),
            "payload published"
        );
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
