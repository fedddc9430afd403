use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use tradecast_core::SessionId;

/// Metadata for one live relay.
#[derive(Clone, Debug)]
struct RelayInfo {
    topic: String,
    opened_at: DateTime<Utc>,
}

/// Tracks every relay currently streaming a response.
#[derive(Default)]
pub struct RelayRegistry {
    relays: DashMap<SessionId, RelayInfo>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay. It stays listed until the returned ticket is dropped.
    pub fn register(self: &Arc<Self>, id: SessionId, topic: &str) -> RelayTicket {
        let _ = self.relays.insert(
            id.clone(),
            RelayInfo {
                topic: topic.to_string(),
                opened_at: Utc::now(),
            },
        );
        debug!(session_id = %id, topic, active = self.relays.len(), "relay registered");
        RelayTicket {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.relays.len()
    }

    pub fn count_for_topic(&self, topic: &str) -> usize {
        self.relays.iter().filter(|r| r.topic == topic).count()
    }

    fn unregister(&self, id: &SessionId) {
        if let Some((_, info)) = self.relays.remove(id) {
            let open_ms = (Utc::now() - info.opened_at).num_milliseconds();
            debug!(
                session_id = %id,
                topic = %info.topic,
                open_ms,
                active = self.relays.len(),
                "relay unregistered"
            );
        }
    }
}

/// Removes its relay from the registry when dropped, including on task abort.
pub struct RelayTicket {
    registry: Arc<RelayRegistry>,
    id: SessionId,
}

impl Drop for RelayTicket {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_drop_unregisters() {
        let registry = Arc::new(RelayRegistry::new());
        let a = registry.register(SessionId::new(), "signals");
        let b = registry.register(SessionId::new(), "other");
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_for_topic("signals"), 1);
        assert_eq!(registry.count_for_topic("other"), 1);

        drop(a);
        assert_eq!(registry.count(), 1);
        drop(b);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.count_for_topic("other"), 0);
    }
}
