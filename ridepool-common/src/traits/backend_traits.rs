//! Capability traits for the external persistence/realtime collaborator.
//!
//! The core never talks to a concrete backend; it consumes these four
//! capability groups (query, mutate, subscribe, identity-by-uuid) and
//! stays agnostic about the wire underneath.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::models::message::{ChatMessage, MessageKind, NewMessage};
use crate::models::page::{Page, Paged};
use crate::models::presence::UserStatus;
use crate::models::room::{ChatRoom, RoomKey};
use crate::models::typing::TypingStatus;

/// Logical channel addressed by a subscribe call. One live connection per
/// key, enforced by the subscription manager.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ChannelKey {
    /// Message insert/update/delete stream for one room.
    RoomMessages(Uuid),
    /// Typing start/stop stream for one room.
    RoomTyping(Uuid),
    /// Presence stream for one user.
    UserPresence(Uuid),
    /// Room-list change stream for one user.
    UserRooms(Uuid),
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKey::RoomMessages(id) => write!(f, "room-messages:{id}"),
            ChannelKey::RoomTyping(id) => write!(f, "room-typing:{id}"),
            ChannelKey::UserPresence(id) => write!(f, "user-presence:{id}"),
            ChannelKey::UserRooms(id) => write!(f, "user-rooms:{id}"),
        }
    }
}

/// Change events delivered on an open channel. Payloads carry the full
/// entity, so the core can merge without a round-trip; dedup is by id.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageInserted(ChatMessage),
    MessageUpdated(ChatMessage),
    MessageDeleted { room_id: Uuid, message_id: Uuid },
    TypingChanged(TypingStatus),
    PresenceChanged(UserStatus),
    RoomChanged(ChatRoom),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoomFilter {
    pub active_only: bool,
    pub unread_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub kind: Option<MessageKind>,
    pub sender: Option<Uuid>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatQuery: Send + Sync {
    /// Rooms for a user, newest activity first.
    async fn fetch_rooms(
        &self,
        user_id: Uuid,
        filter: RoomFilter,
        page: Page,
    ) -> Result<Paged<ChatRoom>, Error>;

    async fn fetch_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>, Error>;

    /// Pair lookup: the same two users always resolve to the same room.
    async fn fetch_room_by_pair(&self, key: RoomKey) -> Result<Option<ChatRoom>, Error>;

    /// Messages for a room, newest first (chat-style "load older" paging).
    async fn fetch_messages(
        &self,
        room_id: Uuid,
        filter: MessageFilter,
        page: Page,
    ) -> Result<Paged<ChatMessage>, Error>;

    /// Re-fetch by id, for events that arrive with a payload the core
    /// cannot use directly.
    async fn fetch_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>, Error>;

    /// Messages in `room_id` where sender != `user_id` and read_at is null.
    async fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<i64, Error>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatMutate: Send + Sync {
    /// Find-or-create on the unordered participant pair.
    async fn create_room(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
        trip_id: Option<Uuid>,
    ) -> Result<ChatRoom, Error>;

    async fn deactivate_room(&self, room_id: Uuid) -> Result<(), Error>;

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, Error>;

    async fn update_message(&self, message_id: Uuid, content: &str) -> Result<ChatMessage, Error>;

    async fn delete_message(&self, message_id: Uuid) -> Result<(), Error>;

    async fn mark_delivered(&self, message_ids: &[Uuid]) -> Result<(), Error>;

    async fn mark_read(&self, message_ids: &[Uuid]) -> Result<(), Error>;

    async fn set_typing(&self, room_id: Uuid, user_id: Uuid, is_typing: bool) -> Result<(), Error>;

    async fn set_presence(&self, status: UserStatus) -> Result<(), Error>;
}

#[async_trait]
pub trait ChatSubscribe: Send + Sync {
    /// Opens a change-event channel for `key`. The returned receiver closes
    /// when the backend drops the channel remotely.
    async fn open_channel(
        &self,
        key: ChannelKey,
        buffer: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, Error>;
}

/// The full collaborator contract the sync engine is built against.
pub trait ChatBackend: ChatQuery + ChatMutate + ChatSubscribe {}

impl<T: ChatQuery + ChatMutate + ChatSubscribe> ChatBackend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_contract_is_mockable_through_a_trait_object() {
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let mut backend = MockChatQuery::new();
        backend
            .expect_unread_count()
            .withf(move |r, u| *r == room_id && *u == user_id)
            .returning(|_, _| Ok(7));

        let query: &dyn ChatQuery = &backend;
        assert_eq!(query.unread_count(room_id, user_id).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn mutate_contract_passes_batches_through() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];

        let mut backend = MockChatMutate::new();
        backend
            .expect_mark_read()
            .withf(|batch| batch.len() == 2)
            .times(1)
            .returning(|_| Ok(()));

        let mutate: &dyn ChatMutate = &backend;
        mutate.mark_read(&ids).await.unwrap();
    }
}
