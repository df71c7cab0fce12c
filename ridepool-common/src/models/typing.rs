use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live typing flag for one (room, user) pair. At most one entry per pair;
/// entries disappear on explicit stop or when the staleness window lapses.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TypingStatus {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

impl TypingStatus {
    pub fn started(room_id: Uuid, user_id: Uuid) -> Self {
        Self {
            room_id,
            user_id,
            is_typing: true,
            updated_at: Utc::now(),
        }
    }

    pub fn stopped(room_id: Uuid, user_id: Uuid) -> Self {
        Self {
            room_id,
            user_id,
            is_typing: false,
            updated_at: Utc::now(),
        }
    }
}
