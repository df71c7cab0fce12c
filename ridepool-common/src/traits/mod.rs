pub mod backend_traits;

pub use backend_traits::{
    ChannelKey, ChatBackend, ChatMutate, ChatQuery, ChatSubscribe, MessageFilter, RoomFilter,
    StreamEvent,
};
