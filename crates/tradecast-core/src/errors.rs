/// Error taxonomy for the event-stream transport.
/// Classifies errors as retryable (client reconnects) or terminal for the request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    // Retryable
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    // Terminal for the request that hit them
    #[error("subscription setup failed: {0}")]
    SubscriptionSetup(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("unterminated frame reached {held} bytes (limit {limit})")]
    FrameTooLarge { held: usize, limit: usize },

    // The client went away; ends the relay quietly
    #[error("write failed: {0}")]
    Write(String),
}

impl StreamError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::SubscriptionSetup(_) => "subscription_setup",
            Self::Publish(_) => "publish",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Write(_) => "write",
        }
    }

    /// Map a non-success HTTP status into the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        Self::Status { status, body }
    }
}
