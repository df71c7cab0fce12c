//! src/presence/mod.rs
//!
//! Maintains this session's online/away state via heartbeat and activity
//! signals, reconnects with exponential backoff on write failures, and
//! answers presence questions about other users under the staleness lease:
//! an online flag is only as good as its last_seen timestamp.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use ridepool_common::Error;
use ridepool_common::models::UserStatus;
use ridepool_common::traits::ChatBackend;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::eventbus::{EventBus, SyncEvent};

/// Session connection state. `Away` is still connected: the heartbeat
/// keeps running, only the advertised status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Away,
    Reconnecting,
    /// Backoff exhausted. Not retried silently; a new `connect()` call is
    /// required.
    Unreachable,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Away => write!(f, "away"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub heartbeat_interval: Duration,
    pub away_after: Duration,
    pub offline_threshold: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

pub struct PresenceManager {
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    me: Uuid,
    settings: PresenceSettings,
    state: RwLock<SessionState>,
    last_activity: Mutex<Instant>,
    hidden: AtomicBool,
    remote: DashMap<Uuid, UserStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceManager {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bus: Arc<EventBus>,
        me: Uuid,
        settings: PresenceSettings,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            backend,
            bus,
            me,
            settings,
            state: RwLock::new(SessionState::Disconnected),
            last_activity: Mutex::new(Instant::now()),
            hidden: AtomicBool::new(false),
            remote: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn current_state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn session_user(&self) -> Uuid {
        self.me
    }

    /// Connects and starts the heartbeat. Reconnectable after
    /// `Unreachable`; calling while already connected restarts the beat.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        self.set_state(SessionState::Connecting).await;

        if let Err(e) = self.write_status().await {
            warn!("[Presence] initial status write failed: {e}");
            if !self.reconnect().await {
                return Err(Error::Session("unable to connect".into()));
            }
        } else {
            self.set_state(SessionState::Connected).await;
        }

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let old = self.heartbeat.lock().replace(tokio::spawn(async move {
            let beat = manager.settings.heartbeat_interval;
            loop {
                tokio::select! {
                    biased;
                    Ok(_) = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("[Presence] heartbeat stopping");
                            break;
                        }
                    }
                    _ = sleep(beat) => {
                        if let Err(e) = manager.beat().await {
                            warn!("[Presence] heartbeat write failed: {e}");
                            if !manager.reconnect().await {
                                break;
                            }
                        }
                    }
                }
            }
        }));
        if let Some(old) = old {
            old.abort();
        }
        info!("[Presence] connected, heartbeat every {:?}", self.settings.heartbeat_interval);
        Ok(())
    }

    /// One heartbeat: refresh last_seen, flipping between connected and
    /// away from the activity clock.
    async fn beat(self: &Arc<Self>) -> Result<(), Error> {
        let idle = self.last_activity.lock().elapsed();
        let away = idle >= self.settings.away_after;
        let next = if away {
            SessionState::Away
        } else {
            SessionState::Connected
        };
        self.write_status_with(away).await?;
        if self.current_state() != next {
            self.set_state(next).await;
        }
        Ok(())
    }

    async fn write_status(self: &Arc<Self>) -> Result<(), Error> {
        let idle = self.last_activity.lock().elapsed();
        self.write_status_with(idle >= self.settings.away_after).await
    }

    async fn write_status_with(&self, away: bool) -> Result<(), Error> {
        let status = UserStatus {
            user_id: self.me,
            is_online: true,
            last_seen_at: Utc::now(),
            status_message: away.then(|| "away".to_string()),
        };
        self.backend.set_presence(status).await
    }

    /// Exponential backoff with jitter, capped delay, bounded attempts.
    /// Returns false once retries are exhausted; the session then parks in
    /// `Unreachable` instead of retrying forever silently.
    async fn reconnect(self: &Arc<Self>) -> bool {
        self.set_state(SessionState::Reconnecting).await;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut delay = self.settings.reconnect_base_delay;
        for attempt in 1..=self.settings.reconnect_max_attempts {
            if *shutdown_rx.borrow() {
                return false;
            }
            // Jitter of up to a quarter of the current delay.
            let jitter_cap = (delay.as_millis() as u64 / 4).max(1);
            let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_cap));
            tokio::select! {
                _ = sleep(delay + jitter) => {}
                Ok(_) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return false;
                    }
                }
            }
            match self.write_status().await {
                Ok(()) => {
                    info!("[Presence] reconnected on attempt {attempt}");
                    self.set_state(SessionState::Connected).await;
                    return true;
                }
                Err(e) => {
                    warn!(
                        "[Presence] reconnect attempt {attempt}/{} failed: {e}",
                        self.settings.reconnect_max_attempts
                    );
                    delay = std::cmp::min(delay * 2, self.settings.reconnect_max_delay);
                }
            }
        }
        error!("[Presence] reconnect attempts exhausted");
        self.set_state(SessionState::Unreachable).await;
        false
    }

    /// Input/scroll/click signal from the UI. Cheap; returning from away
    /// triggers an immediate refresh instead of waiting for the next beat.
    pub fn record_activity(self: &Arc<Self>) {
        *self.last_activity.lock() = Instant::now();
        if self.current_state() == SessionState::Away {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if manager.write_status_with(false).await.is_ok() {
                    manager.set_state(SessionState::Connected).await;
                }
            });
        }
    }

    /// Tab visibility. Hidden does not disconnect; becoming visible again
    /// refreshes status immediately.
    pub fn set_hidden(self: &Arc<Self>, hidden: bool) {
        let was_hidden = self.hidden.swap(hidden, Ordering::SeqCst);
        if was_hidden && !hidden {
            *self.last_activity.lock() = Instant::now();
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.write_status_with(false).await {
                    debug!("[Presence] visibility refresh failed: {e}");
                } else if manager.current_state() == SessionState::Away {
                    manager.set_state(SessionState::Connected).await;
                }
            });
        }
    }

    /// Applies a presence event for another user.
    pub async fn apply_remote(&self, status: UserStatus) {
        if status.user_id == self.me {
            return;
        }
        self.remote.insert(status.user_id, status.clone());
        self.bus.publish(SyncEvent::PresenceChanged(status)).await;
    }

    /// Staleness-aware read: a stored online flag past the offline
    /// threshold reports offline, regardless of what the record claims.
    pub fn is_online(&self, user_id: Uuid) -> bool {
        let threshold = chrono::Duration::from_std(self.settings.offline_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        self.remote
            .get(&user_id)
            .map(|s| s.is_online_at(Utc::now(), threshold))
            .unwrap_or(false)
    }

    pub fn user_status(&self, user_id: Uuid) -> Option<UserStatus> {
        self.remote.get(&user_id).map(|s| s.clone())
    }

    /// Stops the heartbeat and writes a final offline status best-effort.
    pub async fn disconnect(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        let task = self.heartbeat.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self.backend.set_presence(UserStatus::offline(self.me)).await {
            debug!("[Presence] final offline write failed: {e}");
        }
        self.set_state(SessionState::Disconnected).await;
        info!("[Presence] disconnected");
    }

    async fn set_state(&self, next: SessionState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            debug!("[Presence] {} -> {}", state, next);
            *state = next.clone();
        }
        self.bus.publish(SyncEvent::ConnectionChanged(next)).await;
    }
}
