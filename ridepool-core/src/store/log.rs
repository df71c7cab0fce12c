//! Per-room ordered message log. Order is (created_at, message_id);
//! identity is the sole deduplication key, so an optimistic insert and the
//! server-confirmed copy of the same message collapse into one entry no
//! matter which arrives first.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use ridepool_common::models::ChatMessage;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageKey {
    pub created_at: DateTime<Utc>,
    pub message_id: Uuid,
}

impl MessageKey {
    pub fn of(msg: &ChatMessage) -> Self {
        Self {
            created_at: msg.created_at,
            message_id: msg.message_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Default)]
pub struct RoomLog {
    by_key: BTreeMap<MessageKey, Uuid>,
    by_id: HashMap<Uuid, ChatMessage>,
}

impl RoomLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity-keyed merge. An existing entry absorbs the incoming copy:
    /// content and edit flags follow the incoming record, status
    /// timestamps are monotonic (never cleared, never moved backwards by a
    /// stale replay), and the sort key moves if the server re-stamped
    /// created_at on confirmation.
    pub fn upsert(&mut self, incoming: ChatMessage) -> Upsert {
        match self.by_id.get(&incoming.message_id) {
            None => {
                self.by_key
                    .insert(MessageKey::of(&incoming), incoming.message_id);
                self.by_id.insert(incoming.message_id, incoming);
                Upsert::Inserted
            }
            Some(existing) => {
                let old_key = MessageKey::of(existing);
                let mut merged = incoming;
                merged.delivered_at = match (existing.delivered_at, merged.delivered_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                merged.read_at = match (existing.read_at, merged.read_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                merged.is_edited = merged.is_edited || existing.is_edited;
                if merged.edited_at.is_none() {
                    merged.edited_at = existing.edited_at;
                }
                if merged == *existing {
                    return Upsert::Unchanged;
                }
                let new_key = MessageKey::of(&merged);
                if new_key != old_key {
                    self.by_key.remove(&old_key);
                    self.by_key.insert(new_key, merged.message_id);
                }
                self.by_id.insert(merged.message_id, merged);
                Upsert::Updated
            }
        }
    }

    /// Applies `f` to a stored message, fixing the sort key if the closure
    /// changed created_at. Returns false for unknown ids.
    pub fn update<F: FnOnce(&mut ChatMessage)>(&mut self, message_id: Uuid, f: F) -> bool {
        let Some(msg) = self.by_id.get_mut(&message_id) else {
            return false;
        };
        let old_key = MessageKey::of(msg);
        f(msg);
        let new_key = MessageKey::of(msg);
        if new_key != old_key {
            self.by_key.remove(&old_key);
            self.by_key.insert(new_key, message_id);
        }
        true
    }

    pub fn remove(&mut self, message_id: Uuid) -> Option<ChatMessage> {
        let msg = self.by_id.remove(&message_id)?;
        self.by_key.remove(&MessageKey::of(&msg));
        Some(msg)
    }

    pub fn get(&self, message_id: Uuid) -> Option<&ChatMessage> {
        self.by_id.get(&message_id)
    }

    pub fn contains(&self, message_id: Uuid) -> bool {
        self.by_id.contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Display order: created_at ascending, id tie-break.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.by_key
            .values()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    /// Unread from the perspective of `me`: foreign sender, no read_at.
    pub fn unread_for(&self, me: Uuid) -> i64 {
        self.by_id
            .values()
            .filter(|m| m.sender_id != me && m.read_at.is_none())
            .count() as i64
    }

    /// Foreign messages that have not been delivered yet; candidates for
    /// the eager delivery mark when a room is entered.
    pub fn undelivered_foreign(&self, me: Uuid) -> Vec<Uuid> {
        self.by_key
            .values()
            .filter_map(|id| self.by_id.get(id))
            .filter(|m| m.sender_id != me && m.delivered_at.is_none())
            .map(|m| m.message_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridepool_common::models::NewMessage;

    fn msg(room: Uuid, sender: Uuid, text: &str) -> ChatMessage {
        NewMessage::text(room, sender, text).into_message()
    }

    #[test]
    fn optimistic_then_confirmed_is_one_entry() {
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let mut log = RoomLog::new();

        let optimistic = msg(room, sender, "hello");
        assert_eq!(log.upsert(optimistic.clone()), Upsert::Inserted);

        // Server confirmation: same identity, re-stamped timestamp.
        let mut confirmed = optimistic.clone();
        confirmed.created_at = optimistic.created_at + chrono::Duration::milliseconds(40);
        assert_eq!(log.upsert(confirmed), Upsert::Updated);

        assert_eq!(log.len(), 1);
        assert_eq!(log.messages().len(), 1);
    }

    #[test]
    fn replayed_event_is_unchanged() {
        let mut log = RoomLog::new();
        let m = msg(Uuid::new_v4(), Uuid::new_v4(), "hi");
        log.upsert(m.clone());
        assert_eq!(log.upsert(m), Upsert::Unchanged);
    }

    #[test]
    fn stale_replay_cannot_clear_status_timestamps() {
        let mut log = RoomLog::new();
        let mut m = msg(Uuid::new_v4(), Uuid::new_v4(), "hi");
        log.upsert(m.clone());

        let read_copy = {
            let now = Utc::now();
            m.delivered_at = Some(now);
            m.read_at = Some(now);
            m.clone()
        };
        log.upsert(read_copy);

        // A stale copy without the read timestamp replays afterwards.
        let mut stale = m.clone();
        stale.delivered_at = None;
        stale.read_at = None;
        log.upsert(stale);

        let stored = log.get(m.message_id).unwrap();
        assert!(stored.read_at.is_some(), "read_at must survive stale replays");
        assert!(stored.delivered_at.is_some());
    }

    #[test]
    fn order_is_created_at_then_id() {
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let mut log = RoomLog::new();

        let mut first = msg(room, sender, "first");
        let mut second = msg(room, sender, "second");
        let base = Utc::now();
        first.created_at = base;
        second.created_at = base + chrono::Duration::seconds(1);

        // Arrival order reversed; display order must not be.
        log.upsert(second.clone());
        log.upsert(first.clone());

        let ordered = log.messages();
        assert_eq!(ordered[0].message_id, first.message_id);
        assert_eq!(ordered[1].message_id, second.message_id);
    }

    #[test]
    fn unread_ignores_own_messages() {
        let room = Uuid::new_v4();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut log = RoomLog::new();

        log.upsert(msg(room, me, "mine"));
        log.upsert(msg(room, other, "theirs"));
        assert_eq!(log.unread_for(me), 1);
        assert_eq!(log.unread_for(other), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut log = RoomLog::new();
        let m = msg(Uuid::new_v4(), Uuid::new_v4(), "bye");
        log.upsert(m.clone());

        assert!(log.remove(m.message_id).is_some());
        assert!(log.remove(m.message_id).is_none());
        assert!(log.is_empty());
    }
}
