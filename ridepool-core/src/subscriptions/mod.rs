//! src/subscriptions/mod.rs
//!
//! Owns one live backend channel per `ChannelKey` and the pump task that
//! forwards its events into the store's intake queue. This module is the
//! single writer of channel lifecycle state: components may request the
//! same room concurrently and still end up sharing one channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use ridepool_common::traits::{ChannelKey, ChatBackend, StreamEvent};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::eventbus::{EventBus, SyncEvent};

/// Ticket for one subscribe call. Duplicate subscribes and subscribes that
/// failed to open get an inert handle: unsubscribing it does nothing.
pub struct SubscriptionHandle {
    key: ChannelKey,
    active: AtomicBool,
}

impl SubscriptionHandle {
    fn live(key: ChannelKey) -> Self {
        Self {
            key,
            active: AtomicBool::new(true),
        }
    }

    fn inert(key: ChannelKey) -> Self {
        Self {
            key,
            active: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Whether this handle owns the channel. False for duplicate and
    /// failed subscribes, and after the first unsubscribe.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct ChannelEntry {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SubscriptionManager {
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    intake_tx: mpsc::Sender<StreamEvent>,
    channels: Arc<DashMap<ChannelKey, ChannelEntry>>,
    /// Serializes open/close so concurrent subscribes for one key cannot
    /// race past the dedup check.
    lifecycle: Mutex<()>,
    buffer: usize,
}

impl SubscriptionManager {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bus: Arc<EventBus>,
        intake_tx: mpsc::Sender<StreamEvent>,
        buffer: usize,
    ) -> Self {
        Self {
            backend,
            bus,
            intake_tx,
            channels: Arc::new(DashMap::new()),
            lifecycle: Mutex::new(()),
            buffer,
        }
    }

    /// Idempotent subscribe: a second call for an already-open key returns
    /// an inert handle instead of opening a duplicate channel. Open
    /// failures are reported on the event bus, never thrown to the caller.
    pub async fn subscribe(&self, key: ChannelKey) -> SubscriptionHandle {
        let _guard = self.lifecycle.lock().await;

        if self.channels.contains_key(&key) {
            debug!("[Subscriptions] {key} already open, returning no-op handle");
            return SubscriptionHandle::inert(key);
        }

        let rx = match self.backend.open_channel(key, self.buffer).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("[Subscriptions] open failed for {key}: {e}");
                self.bus
                    .publish(SyncEvent::SubscribeFailed {
                        key,
                        error: e.to_string(),
                    })
                    .await;
                return SubscriptionHandle::inert(key);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_pump(key, rx, stop_rx, self.intake_tx.clone(), Arc::clone(&self.channels));
        self.channels.insert(key, ChannelEntry { stop_tx, task });
        debug!("[Subscriptions] opened {key}");
        SubscriptionHandle::live(key)
    }

    /// Safe to call repeatedly, and safe on a handle whose channel already
    /// closed remotely.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if !handle.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.close(handle.key).await;
    }

    /// Key-based teardown used by the store when a room is left. Idempotent.
    pub async fn close(&self, key: ChannelKey) {
        let _guard = self.lifecycle.lock().await;
        if let Some((_, entry)) = self.channels.remove(&key) {
            let _ = entry.stop_tx.send(true);
            debug!("[Subscriptions] closed {key}");
        }
    }

    /// Tears down every open channel; used on logout/reset.
    pub async fn unsubscribe_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let keys: Vec<ChannelKey> = self.channels.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.channels.remove(&key) {
                let _ = entry.stop_tx.send(true);
                entry.task.abort();
            }
        }
        info!("[Subscriptions] all channels closed");
    }

    pub fn is_open(&self, key: ChannelKey) -> bool {
        self.channels.contains_key(&key)
    }

    pub fn open_count(&self) -> usize {
        self.channels.len()
    }
}

/// Forwards events from one backend channel into the intake queue until
/// the channel closes remotely or a stop is requested.
fn spawn_pump(
    key: ChannelKey,
    mut rx: mpsc::Receiver<StreamEvent>,
    mut stop_rx: watch::Receiver<bool>,
    intake_tx: mpsc::Sender<StreamEvent>,
    channels: Arc<DashMap<ChannelKey, ChannelEntry>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Ok(_) = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!("[Subscriptions] pump for {key} stopping");
                        break;
                    }
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if intake_tx.send(event).await.is_err() {
                                warn!("[Subscriptions] intake closed, pump for {key} exiting");
                                break;
                            }
                        }
                        None => {
                            // Remote close: drop our lifecycle entry so a
                            // later subscribe can reopen the key.
                            info!("[Subscriptions] {key} closed remotely");
                            channels.remove(&key);
                            break;
                        }
                    }
                }
            }
        }
    })
}
