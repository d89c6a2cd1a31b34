//! 容量裁剪
//!
//! 内存状态与持久化快照使用同一组函数，保证两条路径的上限一致。

use std::collections::HashMap;

use crate::config::StoreConfig;
use crate::types::{Message, Session};

/// 只保留最新的 `cap` 条（按插入顺序，丢弃最旧的），返回被丢弃的数量
pub fn keep_most_recent<T>(items: &mut Vec<T>, cap: usize) -> usize {
    if items.len() <= cap {
        return 0;
    }
    let overflow = items.len() - cap;
    items.drain(..overflow);
    overflow
}

/// 会话列表为最新优先，只保留前 `cap` 个，返回被淘汰的会话
pub fn cap_sessions(sessions: &mut Vec<Session>, cap: usize) -> Vec<Session> {
    if sessions.len() <= cap {
        return Vec::new();
    }
    sessions.split_off(cap)
}

/// 按配置裁剪会话与消息，淘汰会话的消息桶一并移除
pub fn project(
    config: &StoreConfig,
    sessions: &mut Vec<Session>,
    messages: &mut HashMap<String, Vec<Message>>,
) {
    for evicted in cap_sessions(sessions, config.max_sessions) {
        messages.remove(&evicted.id);
    }
    for bucket in messages.values_mut() {
        keep_most_recent(bucket, config.max_messages_per_session);
    }
}
