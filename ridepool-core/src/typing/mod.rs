//! src/typing/mod.rs
//!
//! Derives the "currently typing" set per room. The local side is a small
//! idle -> typing -> idle machine driven by input events; the remote side
//! is a map of (room, user) entries fed by the typing stream, with a
//! staleness window in case a stop signal is lost. Typing failures are
//! silent: they self-heal on the next signal.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use ridepool_common::Error;
use ridepool_common::models::TypingStatus;
use ridepool_common::traits::ChatBackend;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, info};
use uuid::Uuid;

use crate::eventbus::{EventBus, SyncEvent};

struct LocalTyping {
    deadline: Instant,
    last_renewal: Instant,
}

pub struct TypingCoordinator {
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    me: Uuid,
    local: Arc<DashMap<Uuid, LocalTyping>>,
    remote: Arc<DashMap<(Uuid, Uuid), TypingStatus>>,
    renewal: Duration,
    auto_stop: Duration,
    staleness: chrono::Duration,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TypingCoordinator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bus: Arc<EventBus>,
        me: Uuid,
        renewal: Duration,
        auto_stop: Duration,
        staleness: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let local = Arc::new(DashMap::new());
        let remote = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let staleness =
            chrono::Duration::from_std(staleness).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let sweeper = spawn_sweeper(
            Arc::clone(&backend),
            Arc::clone(&bus),
            me,
            Arc::clone(&local),
            Arc::clone(&remote),
            staleness,
            sweep_interval,
            shutdown_rx,
        );
        Self {
            backend,
            bus,
            me,
            local,
            remote,
            renewal,
            auto_stop,
            staleness,
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// One keystroke/input event. The first one sends the start signal;
    /// the rest only push the auto-stop deadline out, throttled to the
    /// renewal interval so a burst of keystrokes is one cheap update.
    pub async fn input(&self, room_id: Uuid) -> Result<(), Error> {
        let now = Instant::now();
        let needs_start = match self.local.get_mut(&room_id) {
            Some(mut entry) => {
                if now.duration_since(entry.last_renewal) >= self.renewal {
                    entry.deadline = now + self.auto_stop;
                    entry.last_renewal = now;
                }
                false
            }
            None => {
                self.local.insert(
                    room_id,
                    LocalTyping {
                        deadline: now + self.auto_stop,
                        last_renewal: now,
                    },
                );
                true
            }
        };
        if needs_start {
            if let Err(e) = self.backend.set_typing(room_id, self.me, true).await {
                // Drop the entry so the next input retries the start.
                self.local.remove(&room_id);
                debug!("[Typing] start signal failed for room {room_id}: {e}");
            }
        }
        Ok(())
    }

    /// Forced stop: blur or message-send. Sends the stop immediately and
    /// cancels the auto-stop timer. Idempotent when not typing.
    pub async fn stop(&self, room_id: Uuid) {
        if self.local.remove(&room_id).is_some() {
            if let Err(e) = self.backend.set_typing(room_id, self.me, false).await {
                debug!("[Typing] stop signal failed for room {room_id}: {e}");
            }
        }
    }

    pub fn is_typing(&self, room_id: Uuid) -> bool {
        self.local.contains_key(&room_id)
    }

    /// Applies a remote typing event: additive/replacing by (room, user),
    /// removal on stop. Own echoes are ignored.
    pub async fn apply_remote(&self, status: TypingStatus) {
        if status.user_id == self.me {
            return;
        }
        let key = (status.room_id, status.user_id);
        if status.is_typing {
            self.remote.insert(key, status.clone());
        } else {
            self.remote.remove(&key);
        }
        self.bus
            .publish(SyncEvent::TypingChanged {
                room_id: status.room_id,
                users: self.typing_users(status.room_id),
            })
            .await;
    }

    /// Other users currently typing in the room. Entries older than the
    /// staleness window are excluded even without a stop event.
    pub fn typing_users(&self, room_id: Uuid) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        let mut users: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|e| {
                let status = e.value();
                status.room_id == room_id
                    && status.is_typing
                    && now - status.updated_at < self.staleness
            })
            .map(|e| e.key().1)
            .collect();
        users.sort();
        users
    }

    /// Teardown: stop the sweeper and fire best-effort stops for every
    /// room we were typing in. Signal failures never block teardown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(task) = sweeper {
            let _ = task.await;
        }
        let rooms: Vec<Uuid> = self.local.iter().map(|e| *e.key()).collect();
        for room_id in rooms {
            if self.local.remove(&room_id).is_some() {
                let backend = Arc::clone(&self.backend);
                let me = self.me;
                tokio::spawn(async move {
                    if let Err(e) = backend.set_typing(room_id, me, false).await {
                        debug!("[Typing] teardown stop failed for room {room_id}: {e}");
                    }
                });
            }
        }
        info!("[Typing] coordinator shut down");
    }
}

/// Periodic sweep: auto-stops expired local typing states (exactly one
/// stop signal per expiry) and prunes stale remote entries.
fn spawn_sweeper(
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    me: Uuid,
    local: Arc<DashMap<Uuid, LocalTyping>>,
    remote: Arc<DashMap<(Uuid, Uuid), TypingStatus>>,
    staleness: chrono::Duration,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        loop {
            tokio::select! {
                biased;
                Ok(_) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let expired: Vec<Uuid> = local
                        .iter()
                        .filter(|e| e.value().deadline <= now)
                        .map(|e| *e.key())
                        .collect();
                    for room_id in expired {
                        // remove() guards against a concurrent explicit
                        // stop: only one of the two sends the signal.
                        if local.remove(&room_id).is_some() {
                            debug!("[Typing] auto-stop for room {room_id}");
                            if let Err(e) = backend.set_typing(room_id, me, false).await {
                                debug!("[Typing] auto-stop signal failed: {e}");
                            }
                        }
                    }

                    let cutoff = chrono::Utc::now() - staleness;
                    let stale: Vec<(Uuid, Uuid)> = remote
                        .iter()
                        .filter(|e| e.value().updated_at < cutoff)
                        .map(|e| *e.key())
                        .collect();
                    for key in stale {
                        if remote.remove(&key).is_some() {
                            debug!("[Typing] pruned stale entry for user {} in room {}", key.1, key.0);
                            bus.publish(SyncEvent::TypingChanged {
                                room_id: key.0,
                                users: typing_users_of(&remote, key.0, staleness),
                            })
                            .await;
                        }
                    }
                }
            }
        }
    })
}

fn typing_users_of(
    remote: &DashMap<(Uuid, Uuid), TypingStatus>,
    room_id: Uuid,
    staleness: chrono::Duration,
) -> Vec<Uuid> {
    let now = chrono::Utc::now();
    let mut users: Vec<Uuid> = remote
        .iter()
        .filter(|e| {
            let s = e.value();
            s.room_id == room_id && s.is_typing && now - s.updated_at < staleness
        })
        .map(|e| e.key().1)
        .collect();
    users.sort();
    users
}
