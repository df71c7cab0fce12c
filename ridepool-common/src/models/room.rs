use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unordered participant pair. Room lookup is keyed by this, so the same
/// two users always resolve to the same room no matter who opens it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RoomKey {
    low: Uuid,
    high: Uuid,
}

impl RoomKey {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (Uuid, Uuid) {
        (self.low, self.high)
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRoom {
    pub room_id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    /// The match/trip this conversation originated from, if any.
    pub trip_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    /// Rooms are soft-deactivated, never hard-deleted, to preserve history.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn new(participant_a: Uuid, participant_b: Uuid, trip_id: Option<Uuid>) -> Self {
        Self {
            room_id: Uuid::new_v4(),
            participant_a,
            participant_b,
            trip_id,
            last_message_at: None,
            message_count: 0,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> RoomKey {
        RoomKey::new(self.participant_a, self.participant_b)
    }

    /// The participant that is not `me`, if `me` is in this room at all.
    pub fn other_participant(&self, me: Uuid) -> Option<Uuid> {
        if self.participant_a == me {
            Some(self.participant_b)
        } else if self.participant_b == me {
            Some(self.participant_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(RoomKey::new(a, b), RoomKey::new(b, a));
        assert!(RoomKey::new(a, b).contains(a));
        assert!(RoomKey::new(a, b).contains(b));
    }

    #[test]
    fn other_participant_resolves_both_ways() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = ChatRoom::new(a, b, None);
        assert_eq!(room.other_participant(a), Some(b));
        assert_eq!(room.other_participant(b), Some(a));
        assert_eq!(room.other_participant(Uuid::new_v4()), None);
    }
}
