//! coach-chat-core - 教练对话客户端核心库
//!
//! 为移动端与命令行提供统一的对话状态层。
//!
//! # 核心功能
//!
//! - **Chat Store**: 会话/消息状态、流式游标、会话 ID 迁移
//! - **SSE 适配器**: 把 `data:` 行解码为类型化事件，支持取消与空闲超时
//! - **离线队列**: 待同步的打卡/营养记录，带重试上限与错误缓冲
//! - **持久化**: SQLite 键值表保存版本化快照
//!
//! # Feature Flags
//!
//! - `transport`: HTTP 客户端、流式适配器与对话控制器（默认开启）
//!
//! # 架构
//!
//! Store 是纯状态机，不做任何网络请求。控制器读取适配器产出的事件，
//! 逐个驱动 Store 的状态转换；UI 通过订阅事件刷新。

pub mod bounds;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod sse;
pub mod store;
pub mod types;

#[cfg(feature = "transport")]
pub mod transport;

#[cfg(feature = "transport")]
pub mod controller;

// Re-exports
pub use broadcaster::{Broadcaster, SubscriberId};
pub use config::{ClientConfig, QueueConfig, StoreConfig};
pub use error::{Error, Result};
pub use persistence::{
    rehydrate_chat, rehydrate_queue, save_chat, save_queue, KeyValueStore, MemoryKvStore,
    SqliteKvStore, CHAT_STORE_KEY, QUEUE_KEY,
};
pub use protocol::{ChatRequest, ChatResponse, EventType, StoreEvent, StreamEvent};
pub use queue::{
    is_local_id, AttemptOutcome, CheckInDraft, NutritionDraft, OfflineQueue, PendingItem,
    QueueState, SyncBackend, SyncReport,
};
pub use sse::SseDecoder;
pub use store::{ChatSnapshot, ChatState, ChatStore, PersistedChat};
pub use types::*;

#[cfg(feature = "transport")]
pub use transport::{CancelHandle, ChatStream, ChatTransport, CoachClient, StaticToken, TokenProvider};

#[cfg(feature = "transport")]
pub use controller::{ChatController, SendOutcome, SendStatus};
