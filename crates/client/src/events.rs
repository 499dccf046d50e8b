//! Synchronization progress events.
//!
//! Delivery is best-effort over a broadcast channel: publishing never
//! blocks the engine, and subscribers that fall behind lose the oldest
//! events rather than slowing a pull down.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published while a synchronization runs.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pull request started fetching.
    PullStarted { query_id: String },
    /// A page of items was fetched and applied. `items_processed` is
    /// cumulative for the query.
    ItemsFetched {
        query_id: String,
        items_processed: usize,
        total_items: Option<i64>,
    },
    /// A page-boundary commit persisted applied items.
    ItemsCommitted {
        query_id: String,
        items_committed: usize,
    },
    /// A pull request finished, successfully or not.
    PullEnded { query_id: String, failed: bool },
    /// A local failure that did not abort the synchronization.
    LocalException {
        query_id: Option<String>,
        message: String,
    },
}

/// Broadcast bus for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody is listening.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = SyncEventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(SyncEvent::PullStarted {
            query_id: "movies".into(),
        });
        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::PullStarted { query_id } if query_id == "movies"));
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = SyncEventBus::new();
        bus.publish(SyncEvent::PullEnded {
            query_id: "movies".into(),
            failed: false,
        });
    }
}
