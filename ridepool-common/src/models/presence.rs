use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last-known presence for a user. The `is_online` flag is a lease, not a
/// permanent fact: it is only trusted while `last_seen_at` is fresh.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserStatus {
    pub user_id: Uuid,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
    pub status_message: Option<String>,
}

impl UserStatus {
    pub fn online(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_online: true,
            last_seen_at: Utc::now(),
            status_message: None,
        }
    }

    pub fn offline(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_online: false,
            last_seen_at: Utc::now(),
            status_message: None,
        }
    }

    /// Applies the staleness rule: a stored `is_online=true` older than
    /// `offline_threshold` must be treated as offline.
    pub fn is_online_at(&self, now: DateTime<Utc>, offline_threshold: Duration) -> bool {
        self.is_online && now - self.last_seen_at < offline_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_online_flag_reports_offline() {
        let mut status = UserStatus::online(Uuid::new_v4());
        let threshold = Duration::minutes(6);
        assert!(status.is_online_at(Utc::now(), threshold));

        status.last_seen_at = Utc::now() - Duration::minutes(10);
        assert!(!status.is_online_at(Utc::now(), threshold));
    }

    #[test]
    fn fresh_offline_flag_stays_offline() {
        let status = UserStatus::offline(Uuid::new_v4());
        assert!(!status.is_online_at(Utc::now(), Duration::minutes(6)));
    }
}
