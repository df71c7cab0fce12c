// File: ridepool-core/src/config.rs

use std::time::Duration;

/// Tunables for the sync engine. Every timer, threshold and batch bound
/// lives here; components copy the fields they own at construction.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before a batch of queued read-marks is flushed.
    pub read_mark_debounce: Duration,
    /// Maximum ids per mark-read backend call.
    pub read_mark_batch_max: usize,
    /// Retry a failed read-mark batch once before surfacing the failure.
    pub retry_failed_read_marks: bool,

    /// Minimum gap between local typing-deadline renewals.
    pub typing_renewal: Duration,
    /// Inactivity window after which a local typing state auto-stops.
    pub typing_auto_stop: Duration,
    /// Remote typing entries older than this are hidden from reads,
    /// covering a lost stop signal.
    pub typing_staleness: Duration,
    /// How often the typing sweeper checks for expiry.
    pub typing_sweep_interval: Duration,

    /// Presence heartbeat period.
    pub heartbeat_interval: Duration,
    /// Inactivity before the session is reported as away.
    pub away_after: Duration,
    /// Presence lease: an online flag older than this reads as offline.
    pub offline_threshold: Duration,

    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,

    /// Buffer for each backend change-event channel.
    pub channel_buffer: usize,
    /// Buffer for the store's intake queue.
    pub intake_buffer: usize,
    /// Buffer handed to event-bus subscribers.
    pub bus_buffer: usize,

    /// Page size for the history snapshot fetched on room entry.
    pub message_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_mark_debounce: Duration::from_millis(1000),
            read_mark_batch_max: 10,
            retry_failed_read_marks: true,

            typing_renewal: Duration::from_millis(300),
            typing_auto_stop: Duration::from_millis(3000),
            typing_staleness: Duration::from_millis(5000),
            typing_sweep_interval: Duration::from_millis(250),

            heartbeat_interval: Duration::from_secs(30),
            away_after: Duration::from_secs(5 * 60),
            offline_threshold: Duration::from_secs(90),

            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 5,

            channel_buffer: 256,
            intake_buffer: 1024,
            bus_buffer: 256,

            message_page_size: 50,
        }
    }
}
