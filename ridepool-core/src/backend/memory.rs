//! In-memory implementation of the backend capability traits.
//!
//! Backs the demo binary and the integration tests. Mutations broadcast
//! change events to every channel open on the affected key, which is
//! exactly the contract the engine is written against; failure switches
//! let tests force the error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use ridepool_common::Error;
use ridepool_common::models::{
    ChatMessage, ChatRoom, NewMessage, Page, Paged, RoomKey, TypingStatus, UserStatus,
};
use ridepool_common::traits::{
    ChannelKey, ChatMutate, ChatQuery, ChatSubscribe, MessageFilter, RoomFilter, StreamEvent,
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type OrderedMessages = BTreeMap<(DateTime<Utc>, Uuid), ChatMessage>;

#[derive(Default)]
pub struct InMemoryBackend {
    rooms: DashMap<Uuid, ChatRoom>,
    pair_index: DashMap<RoomKey, Uuid>,
    messages: DashMap<Uuid, OrderedMessages>,
    message_rooms: DashMap<Uuid, Uuid>,
    presence: DashMap<Uuid, UserStatus>,
    typing: DashMap<(Uuid, Uuid), TypingStatus>,
    channels: DashMap<ChannelKey, Vec<mpsc::Sender<StreamEvent>>>,

    /// Every id batch passed to mark_read, in call order. Tests assert
    /// debounce/batch behavior against this.
    mark_read_log: Mutex<Vec<Vec<Uuid>>>,

    // Failure switches for tests.
    fail_inserts: AtomicBool,
    fail_marks: AtomicBool,
    fail_subscribes: AtomicBool,
    fail_presence: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_marks(&self, on: bool) {
        self.fail_marks.store(on, Ordering::SeqCst);
    }

    pub fn fail_subscribes(&self, on: bool) {
        self.fail_subscribes.store(on, Ordering::SeqCst);
    }

    pub fn fail_presence(&self, on: bool) {
        self.fail_presence.store(on, Ordering::SeqCst);
    }

    /// Number of live channels open on `key`. Closed receivers are pruned
    /// first, so tests can assert on exact channel counts.
    pub fn open_channel_count(&self, key: ChannelKey) -> usize {
        match self.channels.get_mut(&key) {
            Some(mut entry) => {
                entry.retain(|tx| !tx.is_closed());
                entry.len()
            }
            None => 0,
        }
    }

    /// Total mark-read calls observed, for debounce/batch assertions.
    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_log.lock().len()
    }

    /// The id batches passed to mark_read, in call order.
    pub fn mark_read_batches(&self) -> Vec<Vec<Uuid>> {
        self.mark_read_log.lock().clone()
    }

    async fn broadcast(&self, key: ChannelKey, event: StreamEvent) {
        let senders = match self.channels.get_mut(&key) {
            Some(mut entry) => {
                entry.retain(|tx| !tx.is_closed());
                entry.clone()
            }
            None => return,
        };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    async fn broadcast_room_change(&self, room: &ChatRoom) {
        self.broadcast(
            ChannelKey::UserRooms(room.participant_a),
            StreamEvent::RoomChanged(room.clone()),
        )
        .await;
        self.broadcast(
            ChannelKey::UserRooms(room.participant_b),
            StreamEvent::RoomChanged(room.clone()),
        )
        .await;
    }

    /// Applies `f` to a stored message and broadcasts the update. Missing
    /// ids are skipped: marking something the backend no longer has is not
    /// an error worth failing a batch over.
    async fn update_stored<F>(&self, message_id: Uuid, f: F)
    where
        F: FnOnce(&mut ChatMessage),
    {
        let updated = {
            let Some(room_id) = self.message_rooms.get(&message_id).map(|r| *r) else {
                debug!("[MemoryBackend] update for unknown message {message_id}, skipped");
                return;
            };
            let Some(mut log) = self.messages.get_mut(&room_id) else {
                return;
            };
            let key = log
                .iter()
                .find(|(_, m)| m.message_id == message_id)
                .map(|(k, _)| *k);
            match key {
                Some(k) => {
                    let msg = log.get_mut(&k).expect("key just found");
                    f(msg);
                    Some(msg.clone())
                }
                None => None,
            }
        };
        if let Some(msg) = updated {
            self.broadcast(
                ChannelKey::RoomMessages(msg.room_id),
                StreamEvent::MessageUpdated(msg),
            )
            .await;
        }
    }
}

#[async_trait]
impl ChatQuery for InMemoryBackend {
    async fn fetch_rooms(
        &self,
        user_id: Uuid,
        filter: RoomFilter,
        page: Page,
    ) -> Result<Paged<ChatRoom>, Error> {
        let mut rooms: Vec<ChatRoom> = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value();
            if !room.key().contains(user_id) {
                continue;
            }
            if filter.active_only && !room.is_active {
                continue;
            }
            if filter.unread_only {
                let unread = self.unread_count(room.room_id, user_id).await?;
                if unread == 0 {
                    continue;
                }
            }
            rooms.push(room.clone());
        }
        // Newest activity first; rooms that never saw a message go last.
        rooms.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        let total = rooms.len();
        let items: Vec<ChatRoom> = rooms
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Paged::new(items, total, page.offset))
    }

    async fn fetch_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>, Error> {
        Ok(self.rooms.get(&room_id).map(|r| r.clone()))
    }

    async fn fetch_room_by_pair(&self, key: RoomKey) -> Result<Option<ChatRoom>, Error> {
        let Some(room_id) = self.pair_index.get(&key).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.rooms.get(&room_id).map(|r| r.clone()))
    }

    async fn fetch_messages(
        &self,
        room_id: Uuid,
        filter: MessageFilter,
        page: Page,
    ) -> Result<Paged<ChatMessage>, Error> {
        let Some(log) = self.messages.get(&room_id) else {
            return Ok(Paged::new(vec![], 0, page.offset));
        };
        let matches = |m: &ChatMessage| {
            if let Some(kind) = filter.kind {
                if m.kind != kind {
                    return false;
                }
            }
            if let Some(sender) = filter.sender {
                if m.sender_id != sender {
                    return false;
                }
            }
            if let Some(after) = filter.after {
                if m.created_at < after {
                    return false;
                }
            }
            if let Some(before) = filter.before {
                if m.created_at > before {
                    return false;
                }
            }
            if let Some(ref text) = filter.text {
                if !m.content.contains(text.as_str()) {
                    return false;
                }
            }
            true
        };
        // Newest first: chat paging loads backwards from the tail.
        let filtered: Vec<ChatMessage> = log.values().rev().filter(|m| matches(m)).cloned().collect();
        let total = filtered.len();
        let items: Vec<ChatMessage> = filtered
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Paged::new(items, total, page.offset))
    }

    async fn fetch_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>, Error> {
        let Some(room_id) = self.message_rooms.get(&message_id).map(|r| *r) else {
            return Ok(None);
        };
        let Some(log) = self.messages.get(&room_id) else {
            return Ok(None);
        };
        Ok(log.values().find(|m| m.message_id == message_id).cloned())
    }

    async fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<i64, Error> {
        let Some(log) = self.messages.get(&room_id) else {
            return Ok(0);
        };
        Ok(log
            .values()
            .filter(|m| m.sender_id != user_id && m.read_at.is_none())
            .count() as i64)
    }
}

#[async_trait]
impl ChatMutate for InMemoryBackend {
    async fn create_room(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
        trip_id: Option<Uuid>,
    ) -> Result<ChatRoom, Error> {
        let key = RoomKey::new(participant_a, participant_b);
        if let Some(existing) = self.fetch_room_by_pair(key).await? {
            return Ok(existing);
        }
        let room = ChatRoom::new(participant_a, participant_b, trip_id);
        self.pair_index.insert(key, room.room_id);
        self.rooms.insert(room.room_id, room.clone());
        self.messages.insert(room.room_id, BTreeMap::new());
        self.broadcast_room_change(&room).await;
        Ok(room)
    }

    async fn deactivate_room(&self, room_id: Uuid) -> Result<(), Error> {
        let room = {
            let Some(mut room) = self.rooms.get_mut(&room_id) else {
                return Err(Error::NotFound(format!("room {room_id}")));
            };
            room.is_active = false;
            room.clone()
        };
        self.broadcast_room_change(&room).await;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, Error> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Backend("insert_message refused".into()));
        }
        if !self.rooms.contains_key(&message.room_id) {
            return Err(Error::NotFound(format!("room {}", message.room_id)));
        }
        // Server timestamp wins over the client's optimistic one.
        let mut msg = message.into_message();
        msg.created_at = Utc::now();

        self.message_rooms.insert(msg.message_id, msg.room_id);
        self.messages
            .entry(msg.room_id)
            .or_default()
            .insert((msg.created_at, msg.message_id), msg.clone());

        let room = self.rooms.get_mut(&msg.room_id).map(|mut room| {
            room.last_message_at = Some(msg.created_at);
            room.message_count += 1;
            room.clone()
        });

        self.broadcast(
            ChannelKey::RoomMessages(msg.room_id),
            StreamEvent::MessageInserted(msg.clone()),
        )
        .await;
        if let Some(room) = room {
            self.broadcast_room_change(&room).await;
        }
        Ok(msg)
    }

    async fn update_message(&self, message_id: Uuid, content: &str) -> Result<ChatMessage, Error> {
        let mut result: Option<ChatMessage> = None;
        self.update_stored(message_id, |m| {
            m.content = content.to_string();
            m.edited_at = Some(Utc::now());
            m.is_edited = true;
            result = Some(m.clone());
        })
        .await;
        result.ok_or_else(|| Error::NotFound(format!("message {message_id}")))
    }

    async fn delete_message(&self, message_id: Uuid) -> Result<(), Error> {
        let Some((_, room_id)) = self.message_rooms.remove(&message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };
        if let Some(mut log) = self.messages.get_mut(&room_id) {
            log.retain(|_, m| m.message_id != message_id);
        }
        self.broadcast(
            ChannelKey::RoomMessages(room_id),
            StreamEvent::MessageDeleted {
                room_id,
                message_id,
            },
        )
        .await;
        Ok(())
    }

    async fn mark_delivered(&self, message_ids: &[Uuid]) -> Result<(), Error> {
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(Error::Backend("mark_delivered refused".into()));
        }
        for &id in message_ids {
            self.update_stored(id, |m| {
                if m.delivered_at.is_none() {
                    m.delivered_at = Some(Utc::now());
                }
            })
            .await;
        }
        Ok(())
    }

    async fn mark_read(&self, message_ids: &[Uuid]) -> Result<(), Error> {
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(Error::Backend("mark_read refused".into()));
        }
        self.mark_read_log.lock().push(message_ids.to_vec());
        for &id in message_ids {
            self.update_stored(id, |m| {
                let now = Utc::now();
                if m.delivered_at.is_none() {
                    m.delivered_at = Some(now);
                }
                if m.read_at.is_none() {
                    m.read_at = Some(now);
                }
            })
            .await;
        }
        Ok(())
    }

    async fn set_typing(&self, room_id: Uuid, user_id: Uuid, is_typing: bool) -> Result<(), Error> {
        let status = if is_typing {
            TypingStatus::started(room_id, user_id)
        } else {
            TypingStatus::stopped(room_id, user_id)
        };
        if is_typing {
            self.typing.insert((room_id, user_id), status.clone());
        } else {
            self.typing.remove(&(room_id, user_id));
        }
        self.broadcast(
            ChannelKey::RoomTyping(room_id),
            StreamEvent::TypingChanged(status),
        )
        .await;
        Ok(())
    }

    async fn set_presence(&self, status: UserStatus) -> Result<(), Error> {
        if self.fail_presence.load(Ordering::SeqCst) {
            return Err(Error::Backend("set_presence refused".into()));
        }
        self.presence.insert(status.user_id, status.clone());
        self.broadcast(
            ChannelKey::UserPresence(status.user_id),
            StreamEvent::PresenceChanged(status),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl ChatSubscribe for InMemoryBackend {
    async fn open_channel(
        &self,
        key: ChannelKey,
        buffer: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, Error> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(Error::Subscription(format!("channel {key} refused")));
        }
        let (tx, rx) = mpsc::channel(buffer);
        self.channels.entry(key).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_room_is_idempotent_on_the_pair() -> anyhow::Result<()> {
        let backend = InMemoryBackend::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = backend.create_room(a, b, None).await?;
        let second = backend.create_room(b, a, None).await?;
        assert_eq!(first.room_id, second.room_id);
        Ok(())
    }

    #[tokio::test]
    async fn insert_broadcasts_to_room_channel() -> anyhow::Result<()> {
        let backend = InMemoryBackend::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await?;

        let mut rx = backend
            .open_channel(ChannelKey::RoomMessages(room.room_id), 8)
            .await?;
        let sent = backend
            .insert_message(NewMessage::text(room.room_id, a, "hello"))
            .await?;

        match rx.recv().await {
            Some(StreamEvent::MessageInserted(m)) => assert_eq!(m.message_id, sent.message_id),
            other => panic!("expected MessageInserted, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unread_counts_exclude_own_messages() -> anyhow::Result<()> {
        let backend = InMemoryBackend::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await?;

        backend
            .insert_message(NewMessage::text(room.room_id, a, "one"))
            .await?;
        backend
            .insert_message(NewMessage::text(room.room_id, b, "two"))
            .await?;

        assert_eq!(backend.unread_count(room.room_id, a).await?, 1);
        assert_eq!(backend.unread_count(room.room_id, b).await?, 1);

        let msgs = backend
            .fetch_messages(room.room_id, MessageFilter::default(), Page::first(10))
            .await?;
        let from_b: Vec<Uuid> = msgs
            .items
            .iter()
            .filter(|m| m.sender_id == b)
            .map(|m| m.message_id)
            .collect();
        backend.mark_read(&from_b).await?;
        assert_eq!(backend.unread_count(room.room_id, a).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn message_paging_reports_has_more() -> anyhow::Result<()> {
        let backend = InMemoryBackend::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await?;
        for i in 0..7 {
            backend
                .insert_message(NewMessage::text(room.room_id, a, &format!("m{i}")))
                .await?;
        }

        let first = backend
            .fetch_messages(room.room_id, MessageFilter::default(), Page::first(5))
            .await?;
        assert_eq!(first.items.len(), 5);
        assert!(first.has_more());

        let rest = backend
            .fetch_messages(
                room.room_id,
                MessageFilter::default(),
                Page::first(5).next(),
            )
            .await?;
        assert_eq!(rest.items.len(), 2);
        assert!(!rest.has_more());
        Ok(())
    }

    #[tokio::test]
    async fn filters_narrow_fetches() -> anyhow::Result<()> {
        let backend = InMemoryBackend::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await?;
        backend
            .insert_message(NewMessage::text(room.room_id, a, "pickup at 5"))
            .await?;
        backend
            .insert_message(NewMessage::text(room.room_id, b, "see you then"))
            .await?;

        let filter = MessageFilter {
            text: Some("pickup".into()),
            ..Default::default()
        };
        let found = backend
            .fetch_messages(room.room_id, filter, Page::first(10))
            .await?;
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].sender_id, a);

        let filter = MessageFilter {
            sender: Some(b),
            ..Default::default()
        };
        let found = backend
            .fetch_messages(room.room_id, filter, Page::first(10))
            .await?;
        assert_eq!(found.items.len(), 1);
        Ok(())
    }
}
