//! 辅导平台聊天客户端核心
//!
//! 模块划分：
//! - `api`       REST 端点客户端（候选端点梯子）
//! - `cache`     SQLite 本地缓存
//! - `transport` WebSocket 推送 + 轮询降级
//! - `reconcile` 消息投递调和（去重、回声收拢、排序）
//! - `pagination` 历史消息分页游标
//! - `store`     顶层门面（会话列表 + 活动会话视图）

pub mod api;
pub mod cache;
pub mod error;
pub mod listener;
pub mod pagination;
pub mod reconcile;
pub mod store;
pub mod transport;
pub mod types;

pub use api::{ChatApi, MessagePage, PAGE_SIZE};
pub use cache::{LocalCache, MAX_CACHED_MESSAGES};
pub use error::ChatError;
pub use listener::{ChatListener, EmptyChatListener};
pub use pagination::{PageResult, Paginator};
pub use reconcile::MergeOutcome;
pub use store::{ChatConfig, ConversationStore, ResolveOutcome};
pub use transport::{Delivered, SendOutcome, Transport, TransportMode};
pub use types::{Conversation, DeliveryState, Message, UserRef};
