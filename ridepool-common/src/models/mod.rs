// File: ridepool-common/src/models/mod.rs
pub mod message;
pub mod page;
pub mod presence;
pub mod room;
pub mod typing;

pub use message::{AttachmentRef, ChatMessage, DeliveryState, MessageKind, MessageStatus, NewMessage};
pub use page::{Page, Paged};
pub use presence::UserStatus;
pub use room::{ChatRoom, RoomKey};
pub use typing::TypingStatus;
