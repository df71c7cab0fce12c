//! ridepool-core: the chat synchronization engine.
//!
//! One `ChatStore` per signed-in user. It composes the subscription
//! manager, message status tracker, typing coordinator and presence
//! manager over a pluggable [`ChatBackend`](ridepool_common::traits::ChatBackend)
//! and emits derived-view changes on an in-process event bus.

pub mod backend;
pub mod config;
pub mod eventbus;
pub mod presence;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod typing;

pub use backend::InMemoryBackend;
pub use config::SyncConfig;
pub use eventbus::{EventBus, SyncEvent};
pub use presence::{PresenceManager, PresenceSettings, SessionState};
pub use status::MessageStatusTracker;
pub use store::ChatStore;
pub use subscriptions::{SubscriptionHandle, SubscriptionManager};
pub use typing::TypingCoordinator;

pub use ridepool_common::Error;
