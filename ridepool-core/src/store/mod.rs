//! src/store/mod.rs
//!
//! The composition root of the sync engine. `ChatStore` owns the local
//! room/message state, the subscription manager, the status tracker, the
//! typing coordinator and the presence manager, and runs the intake loop
//! that folds backend change events into the local views. Everything the
//! UI renders comes from here; everything it does goes through here.

pub mod log;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use ridepool_common::Error;
use ridepool_common::models::{
    ChatMessage, ChatRoom, DeliveryState, MessageStatus, NewMessage, Page, Paged, RoomKey,
    UserStatus,
};
use ridepool_common::traits::{
    ChannelKey, ChatBackend, MessageFilter, RoomFilter, StreamEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::eventbus::{EventBus, SyncEvent};
use crate::presence::{PresenceManager, PresenceSettings, SessionState};
use crate::status::MessageStatusTracker;
use crate::subscriptions::SubscriptionManager;
use crate::typing::TypingCoordinator;

use self::log::{RoomLog, Upsert};

pub struct ChatStore {
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    config: SyncConfig,
    me: Uuid,

    rooms: DashMap<Uuid, ChatRoom>,
    logs: DashMap<Uuid, RoomLog>,
    unread: DashMap<Uuid, i64>,
    /// Local lifecycle of our own optimistic sends.
    delivery: DashMap<Uuid, DeliveryState>,

    subscriptions: SubscriptionManager,
    status: MessageStatusTracker,
    typing: TypingCoordinator,
    presence: Arc<PresenceManager>,

    intake_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    intake_task: Mutex<Option<JoinHandle<()>>>,
    intake_stop: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl ChatStore {
    pub fn new(backend: Arc<dyn ChatBackend>, me: Uuid, config: SyncConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_buffer);
        let (intake_stop, _) = watch::channel(false);

        let subscriptions = SubscriptionManager::new(
            Arc::clone(&backend),
            Arc::clone(&bus),
            intake_tx,
            config.channel_buffer,
        );
        let status = MessageStatusTracker::new(
            Arc::clone(&backend),
            Arc::clone(&bus),
            config.read_mark_debounce,
            config.read_mark_batch_max,
            config.retry_failed_read_marks,
        );
        let typing = TypingCoordinator::new(
            Arc::clone(&backend),
            Arc::clone(&bus),
            me,
            config.typing_renewal,
            config.typing_auto_stop,
            config.typing_staleness,
            config.typing_sweep_interval,
        );
        let presence = PresenceManager::new(
            Arc::clone(&backend),
            Arc::clone(&bus),
            me,
            PresenceSettings {
                heartbeat_interval: config.heartbeat_interval,
                away_after: config.away_after,
                offline_threshold: config.offline_threshold,
                reconnect_base_delay: config.reconnect_base_delay,
                reconnect_max_delay: config.reconnect_max_delay,
                reconnect_max_attempts: config.reconnect_max_attempts,
            },
        );

        Arc::new(Self {
            backend,
            bus,
            config,
            me,
            rooms: DashMap::new(),
            logs: DashMap::new(),
            unread: DashMap::new(),
            delivery: DashMap::new(),
            subscriptions,
            status,
            typing,
            presence,
            intake_rx: Mutex::new(Some(intake_rx)),
            intake_task: Mutex::new(None),
            intake_stop,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.me
    }

    /// Receiver of derived-view notifications. Subscribe before `start`
    /// to see everything the engine emits.
    pub async fn events(&self) -> mpsc::Receiver<SyncEvent> {
        self.bus.subscribe(Some(self.config.bus_buffer)).await
    }

    /// Brings the session up: starts the intake loop, connects presence,
    /// and opens the per-user room-list channel.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let rx = self.intake_rx.lock().take();
        let Some(rx) = rx else {
            return Err(Error::Session("store already started".into()));
        };
        let task = spawn_intake(Arc::clone(self), rx, self.intake_stop.subscribe());
        *self.intake_task.lock() = Some(task);

        self.presence.connect().await?;
        self.subscriptions
            .subscribe(ChannelKey::UserRooms(self.me))
            .await;
        info!("[Store] session started for user {}", self.me);
        Ok(())
    }

    // ---- rooms -------------------------------------------------------

    /// Find-or-create the room shared with `other`. The backend keys rooms
    /// by the unordered pair, so both sides resolve to the same record.
    pub async fn open_room(
        &self,
        other: Uuid,
        trip_id: Option<Uuid>,
    ) -> Result<ChatRoom, Error> {
        if other == self.me {
            return Err(Error::Validation("cannot open a room with yourself".into()));
        }
        let key = RoomKey::new(self.me, other);
        let room = match self.backend.fetch_room_by_pair(key).await? {
            Some(room) => room,
            None => self.backend.create_room(self.me, other, trip_id).await?,
        };
        self.rooms.insert(room.room_id, room.clone());
        self.bus.publish(SyncEvent::RoomUpserted(room.clone())).await;
        Ok(room)
    }

    /// Enters a room: loads the newest page of history, then opens the
    /// message and typing channels. The snapshot comes first so merged
    /// events can only move state forward, never land in a void. Received
    /// messages that were never delivered get their delivery mark here.
    pub async fn join_room(&self, room_id: Uuid) -> Result<Vec<ChatMessage>, Error> {
        if !self.rooms.contains_key(&room_id) {
            let room = self
                .backend
                .fetch_room(room_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
            self.rooms.insert(room_id, room);
        }

        let page = Page::first(self.config.message_page_size);
        let snapshot = self
            .backend
            .fetch_messages(room_id, MessageFilter::default(), page)
            .await?;
        for message in snapshot.items {
            self.merge_message(message, false).await;
        }

        self.subscriptions
            .subscribe(ChannelKey::RoomMessages(room_id))
            .await;
        self.subscriptions
            .subscribe(ChannelKey::RoomTyping(room_id))
            .await;

        let undelivered = self
            .logs
            .get(&room_id)
            .map(|log| log.undelivered_foreign(self.me))
            .unwrap_or_default();
        if !undelivered.is_empty() {
            debug!(
                "[Store] marking {} messages delivered on room entry",
                undelivered.len()
            );
            self.status.mark_delivered(&undelivered).await?;
        }

        self.refresh_unread(room_id).await;
        Ok(self.messages(room_id))
    }

    /// Leaves a room: typing stops, queued read-marks flush, channels
    /// close. The local log is kept for a cheap re-entry.
    pub async fn leave_room(&self, room_id: Uuid) {
        self.typing.stop(room_id).await;
        self.status.flush_pending();
        self.subscriptions.close(ChannelKey::RoomMessages(room_id)).await;
        self.subscriptions.close(ChannelKey::RoomTyping(room_id)).await;
        debug!("[Store] left room {room_id}");
    }

    /// Room list for the session user, newest activity first. Refreshes
    /// the cached unread counters from the backend as a side effect.
    pub async fn load_rooms(&self, page: Page) -> Result<Paged<ChatRoom>, Error> {
        let fetched = self
            .backend
            .fetch_rooms(self.me, RoomFilter::default(), page)
            .await?;
        for room in &fetched.items {
            self.rooms.insert(room.room_id, room.clone());
            let count = self.backend.unread_count(room.room_id, self.me).await?;
            let prev = self.unread.insert(room.room_id, count);
            if prev != Some(count) {
                self.bus
                    .publish(SyncEvent::UnreadChanged {
                        room_id: room.room_id,
                        count,
                    })
                    .await;
            }
        }
        Ok(fetched)
    }

    pub fn room(&self, room_id: Uuid) -> Option<ChatRoom> {
        self.rooms.get(&room_id).map(|r| r.clone())
    }

    pub fn unread(&self, room_id: Uuid) -> i64 {
        self.unread.get(&room_id).map(|c| *c).unwrap_or(0)
    }

    // ---- messages ----------------------------------------------------

    /// Older-history paging: fetches one page, merges it, returns the
    /// backend's paging envelope so the caller knows whether more remain.
    pub async fn load_messages(
        &self,
        room_id: Uuid,
        page: Page,
    ) -> Result<Paged<ChatMessage>, Error> {
        let fetched = self
            .backend
            .fetch_messages(room_id, MessageFilter::default(), page)
            .await?;
        for message in &fetched.items {
            self.merge_message(message.clone(), false).await;
        }
        Ok(fetched)
    }

    /// The merged view of a room, oldest first.
    pub fn messages(&self, room_id: Uuid) -> Vec<ChatMessage> {
        self.logs
            .get(&room_id)
            .map(|log| log.messages())
            .unwrap_or_default()
    }

    pub fn delivery_state(&self, message_id: Uuid) -> Option<DeliveryState> {
        self.delivery.get(&message_id).map(|d| *d)
    }

    /// Optimistic send. The message appears locally at once as `Pending`;
    /// the backend write either confirms it in place (same id, server
    /// timestamp) or leaves it visible as `Failed` for retry/discard.
    /// Sending also force-stops our typing indicator for the room.
    pub async fn send(&self, draft: NewMessage) -> Result<ChatMessage, Error> {
        let room_id = draft.room_id;
        if !self.rooms.contains_key(&room_id) {
            return Err(Error::NotFound(format!("room {room_id}")));
        }
        if draft.content.is_empty() && draft.attachment.is_none() {
            return Err(Error::Validation("empty message".into()));
        }

        let optimistic = draft.clone().into_message();
        let message_id = optimistic.message_id;
        self.delivery.insert(message_id, DeliveryState::Pending);
        self.merge_message(optimistic, true).await;
        self.typing.stop(room_id).await;

        self.dispatch(room_id, message_id, draft).await
    }

    pub async fn send_text(&self, room_id: Uuid, content: &str) -> Result<ChatMessage, Error> {
        self.send(NewMessage::text(room_id, self.me, content)).await
    }

    /// Re-sends a failed message under its original id, so a late-arriving
    /// confirmation of the first attempt still dedups against it.
    pub async fn retry_send(&self, message_id: Uuid) -> Result<ChatMessage, Error> {
        if self.delivery_state(message_id) != Some(DeliveryState::Failed) {
            return Err(Error::Validation(format!(
                "message {message_id} is not in a failed state"
            )));
        }
        let stored = self
            .logs
            .iter()
            .find_map(|log| log.get(message_id).cloned())
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;

        let draft = NewMessage {
            message_id: stored.message_id,
            room_id: stored.room_id,
            sender_id: stored.sender_id,
            content: stored.content.clone(),
            kind: stored.kind,
            attachment: stored.attachment.clone(),
            created_at: chrono::Utc::now(),
        };
        self.delivery.insert(message_id, DeliveryState::Pending);
        self.dispatch(stored.room_id, message_id, draft).await
    }

    /// Drops a failed message from the local log. Only failed sends can be
    /// discarded; everything else exists on the server and needs `delete`.
    pub async fn discard_failed(&self, message_id: Uuid) -> Result<(), Error> {
        if self.delivery_state(message_id) != Some(DeliveryState::Failed) {
            return Err(Error::Validation(format!(
                "message {message_id} is not in a failed state"
            )));
        }
        self.delivery.remove(&message_id);
        let room_id = {
            let mut found = None;
            for mut log in self.logs.iter_mut() {
                if log.value_mut().remove(message_id).is_some() {
                    found = Some(*log.key());
                    break;
                }
            }
            found
        };
        if let Some(room_id) = room_id {
            self.bus
                .publish(SyncEvent::MessageRemoved { room_id, message_id })
                .await;
        }
        Ok(())
    }

    /// Server-side edit; the local copy is replaced by the returned record
    /// and the change event that follows replays as a no-op.
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> Result<ChatMessage, Error> {
        let updated = self.backend.update_message(message_id, content).await?;
        self.merge_message(updated.clone(), false).await;
        Ok(updated)
    }

    /// Server-side delete, applied locally at once. The delete event that
    /// comes back on the channel finds nothing and is ignored.
    pub async fn delete_message(&self, room_id: Uuid, message_id: Uuid) -> Result<(), Error> {
        self.backend.delete_message(message_id).await?;
        self.remove_message(room_id, message_id).await;
        Ok(())
    }

    async fn dispatch(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        draft: NewMessage,
    ) -> Result<ChatMessage, Error> {
        match self.backend.insert_message(draft).await {
            Ok(confirmed) => {
                self.delivery.insert(message_id, DeliveryState::Confirmed);
                self.merge_message(confirmed, true).await;
                let merged = self
                    .logs
                    .get(&room_id)
                    .and_then(|log| log.get(message_id).cloned())
                    .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
                Ok(merged)
            }
            Err(e) => {
                warn!("[Store] send failed for message {message_id}: {e}");
                self.delivery.insert(message_id, DeliveryState::Failed);
                self.bus
                    .publish(SyncEvent::SendFailed {
                        room_id,
                        message_id,
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    // ---- read receipts ----------------------------------------------

    /// Marks foreign messages as read. Local state (log timestamps, unread
    /// counter, tracked status) moves immediately; the backend write is
    /// debounced and batched unless `immediate` is set.
    pub async fn mark_read(
        &self,
        room_id: Uuid,
        message_ids: &[Uuid],
        immediate: bool,
    ) -> Result<(), Error> {
        let now = chrono::Utc::now();
        let mut foreign = Vec::new();
        if let Some(mut log) = self.logs.get_mut(&room_id) {
            for &id in message_ids {
                let (is_foreign, unread) = match log.get(id) {
                    Some(m) => (m.sender_id != self.me, m.read_at.is_none()),
                    None => continue,
                };
                if !is_foreign {
                    continue;
                }
                if unread {
                    log.update(id, |m| {
                        m.delivered_at.get_or_insert(now);
                        m.read_at = Some(now);
                    });
                }
                foreign.push(id);
            }
        }
        if foreign.is_empty() {
            return Ok(());
        }
        self.status.mark_read(&foreign, immediate).await?;
        self.refresh_unread(room_id).await;
        Ok(())
    }

    /// "Mark all as read": every unread foreign message in the room, sent
    /// immediately (still chunked to the batch bound).
    pub async fn mark_room_read(&self, room_id: Uuid) -> Result<(), Error> {
        let unread: Vec<Uuid> = self
            .logs
            .get(&room_id)
            .map(|log| {
                log.messages()
                    .into_iter()
                    .filter(|m| m.sender_id != self.me && m.read_at.is_none())
                    .map(|m| m.message_id)
                    .collect()
            })
            .unwrap_or_default();
        if unread.is_empty() {
            return Ok(());
        }
        self.mark_read(room_id, &unread, true).await
    }

    pub fn message_status(&self, message_id: Uuid) -> Option<MessageStatus> {
        self.status.get_status(message_id)
    }

    // ---- typing ------------------------------------------------------

    pub async fn typing_input(&self, room_id: Uuid) -> Result<(), Error> {
        self.presence.record_activity();
        self.typing.input(room_id).await
    }

    pub async fn typing_stop(&self, room_id: Uuid) {
        self.typing.stop(room_id).await;
    }

    pub fn typing_users(&self, room_id: Uuid) -> Vec<Uuid> {
        self.typing.typing_users(room_id)
    }

    // ---- presence ----------------------------------------------------

    /// Opens the presence channel for another user, usually the other
    /// participant of a visible room.
    pub async fn track_presence(&self, user_id: Uuid) {
        self.subscriptions
            .subscribe(ChannelKey::UserPresence(user_id))
            .await;
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn user_status(&self, user_id: Uuid) -> Option<UserStatus> {
        self.presence.user_status(user_id)
    }

    pub fn connection_state(&self) -> SessionState {
        self.presence.current_state()
    }

    pub fn record_activity(&self) {
        self.presence.record_activity();
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.presence.set_hidden(hidden);
    }

    // ---- teardown ----------------------------------------------------

    /// Full teardown, exactly once: typing stops go out, queued read-marks
    /// flush, presence goes offline, every channel closes. Safe to call
    /// again; later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[Store] shutting down session for user {}", self.me);
        self.typing.shutdown().await;
        self.status.shutdown().await;
        self.presence.disconnect().await;
        self.subscriptions.unsubscribe_all().await;

        let _ = self.intake_stop.send(true);
        let task = self.intake_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.bus.shutdown();
    }

    // ---- internals ---------------------------------------------------

    /// Identity-keyed merge into the room log, fanning out to the status
    /// tracker, unread counter and event bus when anything changed.
    /// `live` marks a message the room has not counted yet (a fresh send
    /// or a channel event); history merges replay messages the backend's
    /// `message_count` already includes, so they must not bump it again.
    async fn merge_message(&self, incoming: ChatMessage, live: bool) {
        let room_id = incoming.room_id;
        let message_id = incoming.message_id;
        let created_at = incoming.created_at;
        let from_me = incoming.sender_id == self.me;

        let (outcome, merged) = {
            let mut log = self.logs.entry(room_id).or_default();
            let outcome = log.upsert(incoming);
            (outcome, log.get(message_id).cloned())
        };
        let Some(merged) = merged else { return };
        if outcome == Upsert::Unchanged {
            return;
        }

        if from_me && !self.delivery.contains_key(&message_id) {
            // Our own message confirmed on another device/session.
            self.delivery.insert(message_id, DeliveryState::Confirmed);
        }
        if outcome == Upsert::Inserted {
            self.bump_room_activity(room_id, created_at, live);
        }
        self.status.observe(&merged).await;
        self.refresh_unread(room_id).await;
        self.bus
            .publish(SyncEvent::MessageUpserted {
                room_id,
                message: merged,
            })
            .await;
    }

    async fn remove_message(&self, room_id: Uuid, message_id: Uuid) {
        let removed = self
            .logs
            .get_mut(&room_id)
            .map(|mut log| log.remove(message_id).is_some())
            .unwrap_or(false);
        if !removed {
            return;
        }
        self.delivery.remove(&message_id);
        self.refresh_unread(room_id).await;
        self.bus
            .publish(SyncEvent::MessageRemoved { room_id, message_id })
            .await;
    }

    fn bump_room_activity(&self, room_id: Uuid, at: chrono::DateTime<chrono::Utc>, live: bool) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            if room.last_message_at.is_none_or(|prev| prev < at) {
                room.last_message_at = Some(at);
            }
            if live {
                room.message_count += 1;
            }
        }
    }

    /// Recomputes the room's unread counter from the local log and
    /// publishes only on change.
    async fn refresh_unread(&self, room_id: Uuid) {
        let count = self
            .logs
            .get(&room_id)
            .map(|log| log.unread_for(self.me))
            .unwrap_or(0);
        let prev = self.unread.insert(room_id, count);
        if prev != Some(count) {
            self.bus
                .publish(SyncEvent::UnreadChanged { room_id, count })
                .await;
        }
    }

    /// One backend change event. Events for rooms we have no local state
    /// for are dropped; the snapshot fetched on room entry covers them.
    async fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::MessageInserted(message) | StreamEvent::MessageUpdated(message) => {
                if !self.rooms.contains_key(&message.room_id) {
                    warn!(
                        "[Store] event for unknown room {}, dropped",
                        message.room_id
                    );
                    return;
                }
                // A foreign message arriving on an open channel has, by
                // definition, reached this device: confirm delivery now.
                let deliver = message.sender_id != self.me && message.delivered_at.is_none();
                let message_id = message.message_id;
                self.merge_message(message, true).await;
                if deliver {
                    if let Err(e) = self.status.mark_delivered(&[message_id]).await {
                        warn!("[Store] delivery mark failed for {message_id}: {e}");
                    }
                }
            }
            StreamEvent::MessageDeleted { room_id, message_id } => {
                self.remove_message(room_id, message_id).await;
            }
            StreamEvent::TypingChanged(status) => {
                self.typing.apply_remote(status).await;
            }
            StreamEvent::PresenceChanged(status) => {
                self.presence.apply_remote(status).await;
            }
            StreamEvent::RoomChanged(room) => {
                self.rooms.insert(room.room_id, room.clone());
                self.bus.publish(SyncEvent::RoomUpserted(room)).await;
            }
        }
    }
}

/// The intake loop: every open channel pumps into this single consumer,
/// which applies events in arrival order. One writer means no cross-event
/// races inside the local views.
fn spawn_intake(
    store: Arc<ChatStore>,
    mut rx: mpsc::Receiver<StreamEvent>,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Ok(_) = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!("[Store] intake loop stopping");
                        break;
                    }
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => store.handle_stream_event(event).await,
                        None => {
                            debug!("[Store] intake channel closed");
                            break;
                        }
                    }
                }
            }
        }
    })
}
