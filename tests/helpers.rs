// tests/helpers.rs (a small test-only module)
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ridepool_common::models::ChatRoom;
use ridepool_core::{ChatStore, InMemoryBackend, SyncConfig};
use uuid::Uuid;

/// Timers shrunk so the integration tests finish in milliseconds instead
/// of wall-clock chat timescales.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        read_mark_debounce: Duration::from_millis(100),
        typing_renewal: Duration::from_millis(20),
        typing_auto_stop: Duration::from_millis(250),
        typing_staleness: Duration::from_millis(500),
        typing_sweep_interval: Duration::from_millis(25),
        heartbeat_interval: Duration::from_millis(100),
        away_after: Duration::from_secs(60),
        offline_threshold: Duration::from_secs(60),
        reconnect_base_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(100),
        reconnect_max_attempts: 3,
        ..SyncConfig::default()
    }
}

/// A started session for `user` over the shared backend.
pub async fn session(backend: &Arc<InMemoryBackend>, user: Uuid) -> Arc<ChatStore> {
    let store = ChatStore::new(Arc::clone(backend) as _, user, fast_config());
    store.start().await.expect("store should start");
    store
}

/// Two sessions already joined into their shared room, with presence
/// tracking both ways.
pub async fn connected_pair(
    backend: &Arc<InMemoryBackend>,
) -> (Arc<ChatStore>, Arc<ChatStore>, ChatRoom) {
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let alice = session(backend, a).await;
    let bob = session(backend, b).await;

    let room = alice.open_room(b, None).await.expect("open room");
    alice.join_room(room.room_id).await.expect("alice joins");
    bob.open_room(a, None).await.expect("open room (bob)");
    bob.join_room(room.room_id).await.expect("bob joins");

    alice.track_presence(b).await;
    bob.track_presence(a).await;

    (alice, bob, room)
}

/// Yields long enough for channel pumps and the intake loop to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}
