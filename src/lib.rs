pub mod chat;

// 重新导出常用类型和函数，方便外部使用
pub use chat::{
    error::ChatError,
    listener::{ChatListener, EmptyChatListener},
    store::{ChatConfig, ConversationStore, ResolveOutcome},
    transport::{Delivered, SendOutcome, TransportMode},
    types::{Conversation, DeliveryState, Message, UserRef},
};
