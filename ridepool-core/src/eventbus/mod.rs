//! src/eventbus/mod.rs
//!
//! In-process event bus carrying the store's derived-view notifications to
//! UI subscribers, with guaranteed delivery via bounded MPSC queues.

use std::sync::Arc;

use ridepool_common::models::{ChatMessage, ChatRoom, MessageStatus, UserStatus};
use ridepool_common::traits::ChannelKey;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

use crate::presence::SessionState;

/// Everything the sync engine tells the rest of the application. Consumers
/// never reach into the store's maps; they render from these.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    RoomUpserted(ChatRoom),
    MessageUpserted {
        room_id: Uuid,
        message: ChatMessage,
    },
    MessageRemoved {
        room_id: Uuid,
        message_id: Uuid,
    },
    StatusChanged {
        message_id: Uuid,
        status: MessageStatus,
    },
    UnreadChanged {
        room_id: Uuid,
        count: i64,
    },
    TypingChanged {
        room_id: Uuid,
        users: Vec<Uuid>,
    },
    PresenceChanged(UserStatus),
    ConnectionChanged(SessionState),
    /// An optimistic send failed; the message stays in the log marked
    /// failed so the UI can offer retry/discard.
    SendFailed {
        room_id: Uuid,
        message_id: Uuid,
        error: String,
    },
    /// A read-mark batch failed after its configured retries. Local status
    /// is not rolled back.
    ReadMarkFailed {
        message_ids: Vec<Uuid>,
        error: String,
    },
    SubscribeFailed {
        key: ChannelKey,
        error: String,
    },
}

impl SyncEvent {
    /// Short event tag, mostly for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::RoomUpserted(_) => "room_upserted",
            SyncEvent::MessageUpserted { .. } => "message_upserted",
            SyncEvent::MessageRemoved { .. } => "message_removed",
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::UnreadChanged { .. } => "unread_changed",
            SyncEvent::TypingChanged { .. } => "typing_changed",
            SyncEvent::PresenceChanged(_) => "presence_changed",
            SyncEvent::ConnectionChanged(_) => "connection_changed",
            SyncEvent::SendFailed { .. } => "send_failed",
            SyncEvent::ReadMarkFailed { .. } => "read_mark_failed",
            SyncEvent::SubscribeFailed { .. } => "subscribe_failed",
        }
    }
}

/// Each subscriber gets its own `mpsc::Sender<SyncEvent>`.
///
/// - If a subscriber's buffer fills, `publish` awaits until there is
///   space (backpressure).
/// - If a subscriber dropped its `Receiver`, the send error is ignored
///   and the dead sender is pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<SyncEvent>>>>,
    shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

const DEFAULT_BUFFER_SIZE: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Arc::new(Mutex::new(vec![])),
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Returns a receiver on which events will be delivered.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<SyncEvent> {
        let size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(size);
        let mut subs = self.subscribers.lock().await;
        subs.push(tx);
        rx
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: SyncEvent) {
        let senders = {
            let mut subs = self.subscribers.lock().await;
            subs.retain(|s| !s.is_closed());
            subs.clone()
        };
        for s in senders {
            let _ = s.send(event.clone()).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep, timeout};

    fn tick() -> SyncEvent {
        SyncEvent::UnreadChanged {
            room_id: Uuid::new_v4(),
            count: 0,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe(Some(5)).await;
        let mut rx2 = bus.subscribe(Some(5)).await;

        bus.publish(tick()).await;

        let evt1 = rx1.recv().await.expect("rx1 should get event");
        let evt2 = rx2.recv().await.expect("rx2 should get event");
        assert_eq!(evt1.kind(), "unread_changed");
        assert_eq!(evt2.kind(), "unread_changed");
    }

    #[tokio::test]
    async fn publish_blocks_until_slow_subscriber_drains() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Some(1)).await; // queue size = 1

        bus.publish(tick()).await;

        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let first = rx.recv().await.expect("expected first event");
            let second = rx.recv().await.expect("expected second event");
            (first, second)
        });

        // This publish waits until the reader makes space.
        let second_publish = bus.publish(tick());
        let result = timeout(Duration::from_millis(500), second_publish).await;
        assert!(result.is_ok(), "publish should eventually unblock");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_publish() {
        let bus = EventBus::new();
        let rx = bus.subscribe(Some(1)).await;
        drop(rx);

        // Both publishes complete even though the only subscriber is gone.
        bus.publish(tick()).await;
        let result = timeout(Duration::from_millis(200), bus.publish(tick())).await;
        assert!(result.is_ok());
    }
}
