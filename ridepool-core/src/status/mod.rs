//! src/status/mod.rs
//!
//! Per-message status machine plus the batching/debouncing of outgoing
//! mark-as-read calls. Local state moves optimistically at mark time; the
//! network write happens on the flush timer (or immediately on request).
//! A failed batch never rolls status back: regressing a user-visible read
//! receipt is worse than a stale one.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use ridepool_common::Error;
use ridepool_common::models::{ChatMessage, MessageStatus};
use ridepool_common::traits::ChatBackend;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::eventbus::{EventBus, SyncEvent};

enum MarkCmd {
    Queue(Vec<Uuid>),
    FlushNow,
}

pub struct MessageStatusTracker {
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    statuses: DashMap<Uuid, MessageStatus>,
    cmd_tx: mpsc::UnboundedSender<MarkCmd>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    batch_max: usize,
}

impl MessageStatusTracker {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bus: Arc<EventBus>,
        debounce: Duration,
        batch_max: usize,
        retry_failed: bool,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_task = spawn_flush_task(
            Arc::clone(&backend),
            Arc::clone(&bus),
            cmd_rx,
            shutdown_rx,
            debounce,
            batch_max,
            retry_failed,
        );
        Self {
            backend,
            bus,
            statuses: DashMap::new(),
            cmd_tx,
            shutdown_tx,
            flush_task: Mutex::new(Some(flush_task)),
            batch_max,
        }
    }

    /// Seeds/advances the tracked status from a message's own timestamps.
    /// Called by the store for every message it merges.
    pub async fn observe(&self, message: &ChatMessage) {
        self.apply_transition(message.message_id, message.status())
            .await;
    }

    pub fn get_status(&self, message_id: Uuid) -> Option<MessageStatus> {
        self.statuses.get(&message_id).map(|s| *s)
    }

    /// Monotonic transition: returns the new status if it advanced, None if
    /// the event was stale or a repeat. A Read arriving before Delivered
    /// satisfies Delivered implicitly because the statuses are ordered.
    pub async fn apply_transition(
        &self,
        message_id: Uuid,
        incoming: MessageStatus,
    ) -> Option<MessageStatus> {
        let advanced = {
            let mut entry = self.statuses.entry(message_id).or_insert(MessageStatus::Sent);
            if incoming > *entry {
                *entry = incoming;
                true
            } else {
                false
            }
        };
        if advanced {
            self.bus
                .publish(SyncEvent::StatusChanged {
                    message_id,
                    status: incoming,
                })
                .await;
            Some(incoming)
        } else {
            None
        }
    }

    /// Delivery marking is eager: the backend call goes out immediately
    /// when a received message is observed, no debounce.
    pub async fn mark_delivered(&self, message_ids: &[Uuid]) -> Result<(), Error> {
        let mut advanced = Vec::new();
        for &id in message_ids {
            if !self.statuses.contains_key(&id) {
                debug!("[Status] mark_delivered for unknown message {id}, skipped");
                continue;
            }
            if self
                .apply_transition(id, MessageStatus::Delivered)
                .await
                .is_some()
            {
                advanced.push(id);
            }
        }
        if advanced.is_empty() {
            return Ok(());
        }
        self.backend.mark_delivered(&advanced).await
    }

    /// Read marking: optimistic local transition now, network write on the
    /// debounce timer. `immediate` bypasses the timer for bulk actions
    /// ("mark all as read") but still chunks to the batch bound.
    /// Re-marking an already-read message is a no-op.
    pub async fn mark_read(&self, message_ids: &[Uuid], immediate: bool) -> Result<(), Error> {
        let mut advanced = Vec::new();
        for &id in message_ids {
            if !self.statuses.contains_key(&id) {
                debug!("[Status] mark_read for unknown message {id}, skipped");
                continue;
            }
            if self
                .apply_transition(id, MessageStatus::Read)
                .await
                .is_some()
            {
                advanced.push(id);
            }
        }
        if advanced.is_empty() {
            return Ok(());
        }
        if immediate {
            for chunk in advanced.chunks(self.batch_max) {
                self.backend.mark_read(chunk).await?;
            }
            return Ok(());
        }
        self.cmd_tx
            .send(MarkCmd::Queue(advanced))
            .map_err(|_| Error::ChannelClosed("read-mark queue".into()))
    }

    /// Flushes whatever is pending without waiting for the timer. Used on
    /// room-leave so queued read-marks are not dropped with the room.
    pub fn flush_pending(&self) {
        let _ = self.cmd_tx.send(MarkCmd::FlushNow);
    }

    /// Stops the flush task; pending marks are drained and flushed once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The debounce/batch loop. First queued id arms the timer; ids arriving
/// inside the window join the same batch. On exit the queue is drained and
/// flushed one last time.
fn spawn_flush_task(
    backend: Arc<dyn ChatBackend>,
    bus: Arc<EventBus>,
    mut cmd_rx: mpsc::UnboundedReceiver<MarkCmd>,
    mut shutdown_rx: watch::Receiver<bool>,
    debounce: Duration,
    batch_max: usize,
    retry_failed: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<Uuid> = Vec::new();
        let mut deadline = Instant::now();

        info!(
            "[Status] read-mark flusher started, debounce={:?} batch_max={}",
            debounce, batch_max
        );

        loop {
            tokio::select! {
                biased;
                Ok(_) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("[Status] flusher shutting down");
                        break;
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(MarkCmd::Queue(ids)) => {
                            if buffer.is_empty() {
                                deadline = Instant::now() + debounce;
                            }
                            for id in ids {
                                if !buffer.contains(&id) {
                                    buffer.push(id);
                                }
                            }
                        }
                        Some(MarkCmd::FlushNow) => {
                            flush(&backend, &bus, &mut buffer, batch_max, retry_failed).await;
                        }
                        None => {
                            debug!("[Status] command channel closed");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline), if !buffer.is_empty() => {
                    flush(&backend, &bus, &mut buffer, batch_max, retry_failed).await;
                }
            }
        }

        // Drain anything still queued, then a final flush.
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let MarkCmd::Queue(ids) = cmd {
                for id in ids {
                    if !buffer.contains(&id) {
                        buffer.push(id);
                    }
                }
            }
        }
        if !buffer.is_empty() {
            info!("[Status] final flush: {} read-marks remain", buffer.len());
            flush(&backend, &bus, &mut buffer, batch_max, retry_failed).await;
        }
        debug!("[Status] flusher exited");
    })
}

async fn flush(
    backend: &Arc<dyn ChatBackend>,
    bus: &Arc<EventBus>,
    buffer: &mut Vec<Uuid>,
    batch_max: usize,
    retry_failed: bool,
) {
    if buffer.is_empty() {
        return;
    }
    let ids = std::mem::take(buffer);
    for chunk in ids.chunks(batch_max) {
        let mut result = backend.mark_read(chunk).await;
        if result.is_err() && retry_failed {
            warn!("[Status] read-mark batch failed, retrying once");
            result = backend.mark_read(chunk).await;
        }
        if let Err(e) = result {
            // Local status stays read; the failure is surfaced, not rolled
            // back.
            error!("[Status] read-mark batch failed: {e}");
            bus.publish(SyncEvent::ReadMarkFailed {
                message_ids: chunk.to_vec(),
                error: e.to_string(),
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use ridepool_common::models::NewMessage;
    use ridepool_common::traits::ChatMutate;
    use tokio::time::sleep;

    async fn seeded_tracker(
        debounce: Duration,
        batch_max: usize,
    ) -> (Arc<InMemoryBackend>, MessageStatusTracker, Vec<Uuid>, Uuid) {
        let backend = Arc::new(InMemoryBackend::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..3 {
            let msg = backend
                .insert_message(NewMessage::text(room.room_id, b, &format!("m{i}")))
                .await
                .unwrap();
            ids.push(msg.message_id);
        }

        let bus = Arc::new(EventBus::new());
        let tracker = MessageStatusTracker::new(
            Arc::clone(&backend) as Arc<dyn ChatBackend>,
            bus,
            debounce,
            batch_max,
            false,
        );
        for &id in &ids {
            tracker.apply_transition(id, MessageStatus::Sent).await;
        }
        (backend, tracker, ids, room.room_id)
    }

    #[tokio::test]
    async fn repeated_marks_within_debounce_issue_one_batch() {
        let (backend, tracker, ids, _) = seeded_tracker(Duration::from_millis(300), 10).await;

        tracker.mark_read(&ids[0..1], false).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        tracker.mark_read(&ids[1..2], false).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        tracker.mark_read(&ids[2..3], false).await.unwrap();

        sleep(Duration::from_millis(500)).await;

        let batches = backend.mark_read_batches();
        assert_eq!(batches.len(), 1, "expected one batched call");
        assert_eq!(batches[0].len(), 3, "batch should hold the union of ids");
    }

    #[tokio::test]
    async fn large_batches_are_chunked() {
        let backend = Arc::new(InMemoryBackend::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..23 {
            let msg = backend
                .insert_message(NewMessage::text(room.room_id, b, &format!("m{i}")))
                .await
                .unwrap();
            ids.push(msg.message_id);
        }

        let bus = Arc::new(EventBus::new());
        let tracker = MessageStatusTracker::new(
            Arc::clone(&backend) as Arc<dyn ChatBackend>,
            bus,
            Duration::from_millis(50),
            10,
            false,
        );
        for &id in &ids {
            tracker.apply_transition(id, MessageStatus::Sent).await;
        }

        tracker.mark_read(&ids, true).await.unwrap();

        let batches = backend.mark_read_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[2].len(), 3);
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let (_backend, tracker, ids, _) = seeded_tracker(Duration::from_millis(50), 10).await;
        let id = ids[0];

        assert_eq!(
            tracker.apply_transition(id, MessageStatus::Read).await,
            Some(MessageStatus::Read)
        );
        // A stale delivered event replayed afterwards must not demote.
        assert_eq!(
            tracker.apply_transition(id, MessageStatus::Delivered).await,
            None
        );
        assert_eq!(tracker.get_status(id), Some(MessageStatus::Read));
    }

    #[tokio::test]
    async fn re_marking_read_is_a_noop() {
        let (backend, tracker, ids, _) = seeded_tracker(Duration::from_millis(50), 10).await;

        tracker.mark_read(&ids[0..1], true).await.unwrap();
        tracker.mark_read(&ids[0..1], true).await.unwrap();

        assert_eq!(backend.mark_read_calls(), 1);
    }

    #[tokio::test]
    async fn marking_unknown_message_is_a_noop() {
        let (backend, tracker, _ids, _) = seeded_tracker(Duration::from_millis(50), 10).await;

        tracker
            .mark_read(&[Uuid::new_v4()], true)
            .await
            .expect("unknown ids must not error");
        assert_eq!(backend.mark_read_calls(), 0);
    }

    #[tokio::test]
    async fn failed_batch_is_surfaced_without_rollback() {
        let backend = Arc::new(InMemoryBackend::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = backend.create_room(a, b, None).await.unwrap();
        let msg = backend
            .insert_message(NewMessage::text(room.room_id, b, "hi"))
            .await
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let mut bus_rx = bus.subscribe(Some(16)).await;
        let tracker = MessageStatusTracker::new(
            Arc::clone(&backend) as Arc<dyn ChatBackend>,
            bus,
            Duration::from_millis(30),
            10,
            false,
        );
        tracker
            .apply_transition(msg.message_id, MessageStatus::Sent)
            .await;

        backend.fail_marks(true);
        tracker.mark_read(&[msg.message_id], false).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        // Optimistic status survives the failure.
        assert_eq!(tracker.get_status(msg.message_id), Some(MessageStatus::Read));

        let mut saw_failure = false;
        while let Ok(event) = bus_rx.try_recv() {
            if let SyncEvent::ReadMarkFailed { message_ids, .. } = event {
                assert_eq!(message_ids, vec![msg.message_id]);
                saw_failure = true;
            }
        }
        assert!(saw_failure, "expected a ReadMarkFailed event");
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_marks() {
        let (backend, tracker, ids, _) = seeded_tracker(Duration::from_secs(60), 10).await;

        // Debounce is a minute out; shutdown must not drop the queue.
        tracker.mark_read(&ids, false).await.unwrap();
        tracker.shutdown().await;

        assert_eq!(backend.mark_read_calls(), 1);
        assert_eq!(backend.mark_read_batches()[0].len(), 3);
    }
}
