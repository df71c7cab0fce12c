// src/main.rs
//
// Demo driver for the sync engine: two sessions (rider and driver) share
// an in-memory backend and run a short conversation with typing
// indicators, delivery confirmation and read receipts, printing every
// derived-view event as it lands.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use ridepool_core::{ChatStore, InMemoryBackend, SyncConfig, SyncEvent};

#[derive(Parser, Debug, Clone)]
#[command(name = "ridepool")]
#[command(author, version, about = "RidePool chat sync engine demo")]
struct Args {
    /// Number of messages the rider sends
    #[arg(long, default_value = "3")]
    messages: u32,

    /// Pause between demo steps, in milliseconds
    #[arg(long, default_value = "200")]
    step_ms: u64,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let level: tracing::Level = level.parse().unwrap_or(tracing::Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);
    let step = Duration::from_millis(args.step_ms);

    info!("RidePool sync demo starting; {} messages", args.messages);

    let backend = Arc::new(InMemoryBackend::new());
    let rider_id = Uuid::new_v4();
    let driver_id = Uuid::new_v4();
    info!("rider={rider_id} driver={driver_id}");

    let rider = ChatStore::new(Arc::clone(&backend) as _, rider_id, SyncConfig::default());
    let driver = ChatStore::new(Arc::clone(&backend) as _, driver_id, SyncConfig::default());

    // Watch the driver's view of the conversation.
    let mut driver_events = driver.events().await;
    let printer = tokio::spawn(async move {
        while let Some(event) = driver_events.recv().await {
            match &event {
                SyncEvent::MessageUpserted { message, .. } => {
                    info!(
                        "[driver view] {} from {}: {:?} ({})",
                        event.kind(),
                        message.sender_id,
                        message.content,
                        message.status()
                    );
                }
                SyncEvent::TypingChanged { users, .. } => {
                    info!("[driver view] typing: {users:?}");
                }
                SyncEvent::UnreadChanged { count, .. } => {
                    info!("[driver view] unread: {count}");
                }
                other => info!("[driver view] {}", other.kind()),
            }
        }
    });

    rider.start().await?;
    driver.start().await?;

    let room = rider.open_room(driver_id, Some(Uuid::new_v4())).await?;
    rider.join_room(room.room_id).await?;
    driver.open_room(rider_id, None).await?;
    driver.join_room(room.room_id).await?;

    rider.track_presence(driver_id).await;
    driver.track_presence(rider_id).await;

    for i in 1..=args.messages {
        // A short typing burst before each send.
        for _ in 0..3 {
            rider.typing_input(room.room_id).await?;
            sleep(step / 4).await;
        }
        let text = format!("demo message {i}");
        match rider.send_text(room.room_id, &text).await {
            Ok(sent) => info!("rider sent {} ({:?})", sent.message_id, sent.status()),
            Err(e) => error!("send failed: {e}"),
        }
        sleep(step).await;
    }

    info!(
        "driver sees {} messages, {} unread, rider online={}",
        driver.messages(room.room_id).len(),
        driver.unread(room.room_id),
        driver.is_online(rider_id)
    );

    driver.mark_room_read(room.room_id).await?;
    sleep(step).await;

    for message in rider.messages(room.room_id) {
        info!(
            "rider's copy {}: {:?}",
            message.message_id,
            rider.message_status(message.message_id)
        );
    }

    rider.leave_room(room.room_id).await;
    driver.leave_room(room.room_id).await;
    rider.shutdown().await;
    driver.shutdown().await;
    printer.abort();

    info!("demo finished");
    Ok(())
}
