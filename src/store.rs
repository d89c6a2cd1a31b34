//! Chat Session Store
//!
//! 会话、消息与全局唯一的流式游标。
//!
//! - `ChatState`: 纯状态 + 转换逻辑，无 I/O，所有操作同步完成
//! - `ChatStore`: 加锁包装（一次操作 = 一次加锁，保证原子性）+ 变更推送
//!
//! 非法操作（例如没有活跃流时 complete）一律降级为 no-op，不返回错误；
//! 唯一的例外是 `start_streaming` 的单流保护。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bounds;
use crate::broadcaster::{Broadcaster, SubscriberId};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::protocol::{EventType, StoreEvent};
use crate::types::{
    current_time_ms, new_local_session_id, Message, MessageMetadata, MessagePatch, MessageRole,
    MessageStatus, NewMessage, Session, StreamingCursor, ToolTrace,
};

/// 重启后仍处于 streaming 的消息被标记的错误文本
pub const INTERRUPTED_MESSAGE: &str = "Response was interrupted.";

/// 持久化快照格式版本
pub const PERSIST_VERSION: u32 = 1;

/// Chat 状态（纯 reducer）
#[derive(Debug, Clone)]
pub struct ChatState {
    config: StoreConfig,
    sessions: Vec<Session>,
    current_session_id: Option<String>,
    messages: HashMap<String, Vec<Message>>,
    cursor: StreamingCursor,
    /// 占位消息所属会话（随 update_session_id 一起改写）
    streaming_session_id: Option<String>,
    /// 待推送的变更事件
    events: Vec<StoreEvent>,
}

impl ChatState {
    /// 创建空状态
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: Vec::new(),
            current_session_id: None,
            messages: HashMap::new(),
            cursor: StreamingCursor::default(),
            streaming_session_id: None,
            events: Vec::new(),
        }
    }

    // ==================== 读取 ====================

    /// 会话列表（最新优先）
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    /// 会话的消息（按时间顺序）
    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(session_id).iter().find(|m| m.id == message_id)
    }

    pub fn cursor(&self) -> &StreamingCursor {
        &self.cursor
    }

    pub fn is_streaming(&self) -> bool {
        self.cursor.is_streaming
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ==================== 会话操作 ====================

    /// 创建新会话，插入列表头部并设为当前会话
    pub fn create_session(&mut self) -> String {
        let id = new_local_session_id();
        let now = current_time_ms();

        self.insert_session(Session {
            id: id.clone(),
            created_at: now,
            last_message_at: now,
            message_count: 0,
        });
        self.current_session_id = Some(id.clone());

        tracing::debug!("创建会话: id={}", id);
        id
    }

    /// 切换当前会话（不校验 id 是否存在）
    pub fn set_current_session(&mut self, id: Option<&str>) {
        self.current_session_id = id.map(str::to_string);
        self.events.push(StoreEvent::SessionsChanged);
    }

    /// 用服务端分配的 ID 替换本地 ID
    ///
    /// 在一次调用内完成：会话改名、消息桶换 key、每条消息的 session_id 改写、
    /// 当前会话指针与流式游标的归属会话同步改写。
    ///
    /// 若 `new_id` 已是另一个会话，旧会话的消息追加到该会话后并移除旧会话。
    pub fn update_session_id(&mut self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }

        if self.current_session_id.as_deref() == Some(old_id) {
            self.current_session_id = Some(new_id.to_string());
        }
        if self.streaming_session_id.as_deref() == Some(old_id) {
            self.streaming_session_id = Some(new_id.to_string());
        }

        let Some(old_pos) = self.sessions.iter().position(|s| s.id == old_id) else {
            self.events.push(StoreEvent::SessionsChanged);
            return;
        };

        let mut bucket = self.messages.remove(old_id).unwrap_or_default();
        for message in bucket.iter_mut() {
            message.session_id = new_id.to_string();
        }

        match self.sessions.iter().position(|s| s.id == new_id) {
            Some(existing_pos) => {
                let old = self.sessions.remove(old_pos);
                let existing_pos = if old_pos < existing_pos {
                    existing_pos - 1
                } else {
                    existing_pos
                };
                let existing = &mut self.sessions[existing_pos];
                existing.message_count += old.message_count;
                existing.last_message_at = existing.last_message_at.max(old.last_message_at);

                let target = self.messages.entry(new_id.to_string()).or_default();
                target.extend(bucket);
                if bounds::keep_most_recent(target, self.config.max_messages_per_session) > 0 {
                    self.release_evicted_placeholder(new_id);
                }
            }
            None => {
                self.sessions[old_pos].id = new_id.to_string();
                self.messages.insert(new_id.to_string(), bucket);
            }
        }

        tracing::debug!("会话 ID 更新: {} -> {}", old_id, new_id);
        self.events.push(StoreEvent::SessionsChanged);
        self.events.push(StoreEvent::MessagesChanged {
            session_id: new_id.to_string(),
        });
    }

    /// 删除会话及其消息
    pub fn clear_session(&mut self, id: &str) {
        self.sessions.retain(|s| s.id != id);
        self.messages.remove(id);

        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = None;
        }
        if self.streaming_session_id.as_deref() == Some(id) {
            self.reset_cursor();
        }

        tracing::debug!("删除会话: id={}", id);
        self.events.push(StoreEvent::SessionsChanged);
        self.events.push(StoreEvent::MessagesChanged {
            session_id: id.to_string(),
        });
    }

    /// 清空全部会话、消息与流式游标
    pub fn clear_all_sessions(&mut self) {
        self.sessions.clear();
        self.messages.clear();
        self.current_session_id = None;
        self.reset_cursor();

        tracing::debug!("清空全部会话");
        self.events.push(StoreEvent::SessionsChanged);
    }

    // ==================== 消息操作 ====================

    /// 追加消息（超出上限时丢弃最旧的），返回新消息 ID
    ///
    /// 所属会话不存在时按该 ID 补建会话，保证消息总能找到所属会话。
    pub fn add_message(&mut self, input: NewMessage) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session_id = input.session_id.clone();
        let timestamp = input.timestamp;

        if self.session(&session_id).is_none() {
            self.insert_session(Session {
                id: session_id.clone(),
                created_at: timestamp,
                last_message_at: timestamp,
                message_count: 0,
            });
        }

        let bucket = self.messages.entry(session_id.clone()).or_default();
        bucket.push(input.into_message(id.clone()));
        let dropped = bounds::keep_most_recent(bucket, self.config.max_messages_per_session);
        if dropped > 0 {
            tracing::debug!("消息超出上限，丢弃最旧的 {} 条: session={}", dropped, session_id);
            self.release_evicted_placeholder(&session_id);
        }

        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            session.message_count += 1;
            session.last_message_at = timestamp;
        }

        self.events.push(StoreEvent::SessionsChanged);
        self.events.push(StoreEvent::MessagesChanged { session_id });
        id
    }

    /// 合并字段到指定消息；找不到时 no-op
    pub fn update_message(&mut self, session_id: &str, message_id: &str, patch: MessagePatch) {
        let Some(message) = self.find_message_mut(session_id, message_id) else {
            tracing::trace!("update_message: 未找到消息 {}/{}", session_id, message_id);
            return;
        };
        patch.apply(message);
        self.events.push(StoreEvent::MessagesChanged {
            session_id: session_id.to_string(),
        });
    }

    /// 补充工具调用轨迹
    pub fn set_message_tool_trace(
        &mut self,
        session_id: &str,
        message_id: &str,
        tool_trace: Vec<ToolTrace>,
    ) {
        self.update_message(
            session_id,
            message_id,
            MessagePatch {
                tool_trace: Some(tool_trace),
                ..Default::default()
            },
        );
    }

    /// 补充置信度、缺失数据与免责声明
    pub fn set_message_metadata(
        &mut self,
        session_id: &str,
        message_id: &str,
        metadata: MessageMetadata,
    ) {
        self.update_message(
            session_id,
            message_id,
            MessagePatch {
                confidence: metadata.confidence,
                data_gaps: metadata.data_gaps,
                disclaimers: metadata.disclaimers,
                ..Default::default()
            },
        );
    }

    // ==================== 流式协议 ====================
    //
    // idle → streaming → (completed | cancelled | errored) → idle

    /// 开始流式回复：创建空的占位助手消息
    ///
    /// 已有活跃流时拒绝，不覆盖游标。
    pub fn start_streaming(&mut self, session_id: &str) -> Result<String> {
        if self.cursor.is_streaming {
            tracing::warn!(
                "拒绝 start_streaming: 已有活跃流 message={:?}",
                self.cursor.message_id
            );
            return Err(Error::StreamAlreadyActive);
        }

        let message_id = self.add_message(NewMessage {
            session_id: session_id.to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: current_time_ms(),
            status: MessageStatus::Streaming,
        });

        self.cursor = StreamingCursor {
            content: String::new(),
            is_streaming: true,
            message_id: Some(message_id.clone()),
        };
        self.streaming_session_id = Some(session_id.to_string());

        tracing::debug!("开始流式回复: session={}, message={}", session_id, message_id);
        self.events.push(StoreEvent::StreamingChanged { is_streaming: true });
        Ok(message_id)
    }

    /// 一次发送的开端：写入用户消息并开始流式回复
    ///
    /// 已有活跃流时整体拒绝，不写入任何内容。返回占位消息 ID。
    pub fn begin_exchange(&mut self, user: NewMessage) -> Result<String> {
        if self.cursor.is_streaming {
            return Err(Error::StreamAlreadyActive);
        }
        let session_id = user.session_id.clone();
        self.add_message(user);
        self.start_streaming(&session_id)
    }

    /// 追加 token，同时写入游标和占位消息
    ///
    /// 空闲时忽略（取消后迟到的 token）；占位消息不存在时只更新游标。
    pub fn append_streaming_content(&mut self, token: &str) {
        if !self.cursor.is_streaming {
            tracing::trace!("忽略迟到的 token: len={}", token.len());
            return;
        }

        self.cursor.content.push_str(token);
        let content = self.cursor.content.clone();

        if let Some((session_id, message)) = self.streaming_message_mut() {
            message.content = content;
            self.events.push(StoreEvent::MessagesChanged { session_id });
        }
    }

    /// 完成流式回复
    ///
    /// `final_content` 存在时覆盖累积的 token 内容。
    pub fn complete_streaming(&mut self, final_content: Option<&str>) {
        if !self.cursor.is_streaming {
            return;
        }

        let content = final_content
            .map(str::to_string)
            .unwrap_or_else(|| self.cursor.content.clone());

        if let Some((session_id, message)) = self.streaming_message_mut() {
            message.content = content;
            message.status = MessageStatus::Complete;
            self.events.push(StoreEvent::MessagesChanged { session_id });
        }

        tracing::debug!("流式回复完成: message={:?}", self.cursor.message_id);
        self.reset_cursor();
    }

    /// 取消流式回复：占位消息整体移除，不留痕迹
    pub fn cancel_streaming(&mut self) {
        if !self.cursor.is_streaming {
            return;
        }

        if let (Some(session_id), Some(message_id)) = (
            self.streaming_owner().map(str::to_string),
            self.cursor.message_id.clone(),
        ) {
            let mut removed = false;
            if let Some(bucket) = self.messages.get_mut(&session_id) {
                let before = bucket.len();
                bucket.retain(|m| m.id != message_id);
                removed = bucket.len() < before;
            }
            if removed {
                if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
                    session.message_count = session.message_count.saturating_sub(1);
                }
                self.events.push(StoreEvent::SessionsChanged);
                self.events.push(StoreEvent::MessagesChanged { session_id });
            }
        }

        tracing::debug!("流式回复已取消: message={:?}", self.cursor.message_id);
        self.reset_cursor();
    }

    /// 流式回复出错：占位消息保留，标记为 error
    pub fn set_streaming_error(&mut self, error_message: &str) {
        if !self.cursor.is_streaming {
            return;
        }

        if let Some((session_id, message)) = self.streaming_message_mut() {
            message.status = MessageStatus::Error;
            message.error_message = Some(error_message.to_string());
            self.events.push(StoreEvent::MessagesChanged { session_id });
        }

        tracing::debug!(
            "流式回复出错: message={:?}, error={}",
            self.cursor.message_id,
            error_message
        );
        self.reset_cursor();
    }

    // ==================== 持久化投影 ====================

    /// 生成持久化快照（与内存使用同一裁剪函数，游标不持久化）
    pub fn to_persisted(&self) -> PersistedChat {
        let mut sessions = self.sessions.clone();
        let mut messages = self.messages.clone();
        bounds::project(&self.config, &mut sessions, &mut messages);

        PersistedChat {
            version: PERSIST_VERSION,
            sessions,
            current_session_id: self.current_session_id.clone(),
            messages,
        }
    }

    /// 从持久化快照恢复
    ///
    /// 仍处于 streaming 的消息说明进程在流式过程中退出，改为 error。
    pub fn from_persisted(config: StoreConfig, persisted: PersistedChat) -> Self {
        let PersistedChat {
            mut sessions,
            current_session_id,
            mut messages,
            ..
        } = persisted;

        bounds::project(&config, &mut sessions, &mut messages);
        messages.retain(|id, _| sessions.iter().any(|s| &s.id == id));

        let mut interrupted = 0;
        for message in messages.values_mut().flatten() {
            if message.status == MessageStatus::Streaming {
                message.status = MessageStatus::Error;
                message.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            tracing::info!("恢复时发现 {} 条中断的流式消息", interrupted);
        }

        let mut state = Self::new(config);
        state.sessions = sessions;
        state.current_session_id = current_session_id;
        state.messages = messages;
        state
    }

    // ==================== 内部 ====================

    fn insert_session(&mut self, session: Session) {
        self.messages.entry(session.id.clone()).or_default();
        self.sessions.insert(0, session);

        for evicted in bounds::cap_sessions(&mut self.sessions, self.config.max_sessions) {
            tracing::debug!("会话超出上限，淘汰: id={}", evicted.id);
            self.messages.remove(&evicted.id);
            if self.streaming_session_id.as_deref() == Some(evicted.id.as_str()) {
                self.reset_cursor();
            }
        }

        self.events.push(StoreEvent::SessionsChanged);
    }

    fn find_message_mut(&mut self, session_id: &str, message_id: &str) -> Option<&mut Message> {
        self.messages
            .get_mut(session_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    /// 占位消息所属会话：优先使用记录的归属会话，否则取当前会话
    fn streaming_owner(&self) -> Option<&str> {
        self.streaming_session_id
            .as_deref()
            .or(self.current_session_id.as_deref())
    }

    fn streaming_message_mut(&mut self) -> Option<(String, &mut Message)> {
        let session_id = self.streaming_owner()?.to_string();
        let message_id = self.cursor.message_id.clone()?;
        let message = self.find_message_mut(&session_id, &message_id)?;
        Some((session_id, message))
    }

    /// 占位消息被上限淘汰时游标随之复位，游标不能指向不存在的消息
    fn release_evicted_placeholder(&mut self, session_id: &str) {
        if !self.cursor.is_streaming || self.streaming_session_id.as_deref() != Some(session_id) {
            return;
        }
        let Some(message_id) = self.cursor.message_id.clone() else {
            return;
        };
        if self.find_message_mut(session_id, &message_id).is_none() {
            tracing::debug!("占位消息被淘汰，结束流式回复: message={}", message_id);
            self.reset_cursor();
        }
    }

    fn reset_cursor(&mut self) {
        let was_streaming = self.cursor.is_streaming;
        self.cursor = StreamingCursor::default();
        self.streaming_session_id = None;
        if was_streaming {
            self.events.push(StoreEvent::StreamingChanged {
                is_streaming: false,
            });
        }
    }

    fn take_events(&mut self) -> Vec<StoreEvent> {
        let mut events = std::mem::take(&mut self.events);
        events.dedup();
        events
    }
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// 持久化快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedChat {
    pub version: u32,
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub current_session_id: Option<String>,
    #[serde(default)]
    pub messages: HashMap<String, Vec<Message>>,
}

/// 只读快照（供 UI 渲染）
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
    pub messages: HashMap<String, Vec<Message>>,
    pub cursor: StreamingCursor,
}

/// Chat Store（注入式实例，可并存多个）
pub struct ChatStore {
    state: Mutex<ChatState>,
    broadcaster: Arc<Broadcaster>,
}

impl ChatStore {
    /// 创建空 Store
    pub fn new(config: StoreConfig) -> Self {
        Self::from_state(ChatState::new(config))
    }

    /// 由已有状态创建（用于恢复）
    pub fn from_state(state: ChatState) -> Self {
        Self {
            state: Mutex::new(state),
            broadcaster: Broadcaster::new(),
        }
    }

    /// 订阅变更
    pub fn subscribe(&self, events: Vec<EventType>) -> (SubscriberId, mpsc::Receiver<StoreEvent>) {
        self.broadcaster.subscribe(events)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.broadcaster.unsubscribe(id);
    }

    /// 只读访问
    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&*self.state.lock())
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> ChatSnapshot {
        self.read(|s| ChatSnapshot {
            sessions: s.sessions.clone(),
            current_session_id: s.current_session_id.clone(),
            messages: s.messages.clone(),
            cursor: s.cursor.clone(),
        })
    }

    /// 一次加锁内完成变更，释放锁后推送事件
    fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let (result, events) = {
            let mut state = self.state.lock();
            let result = f(&mut *state);
            (result, state.take_events())
        };
        for event in events {
            self.broadcaster.broadcast(event);
        }
        result
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.read(|s| s.sessions.clone())
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.read(|s| s.current_session_id.clone())
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.read(|s| s.messages(session_id).to_vec())
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<Message> {
        self.read(|s| s.message(session_id, message_id).cloned())
    }

    pub fn cursor(&self) -> StreamingCursor {
        self.read(|s| s.cursor.clone())
    }

    pub fn is_streaming(&self) -> bool {
        self.read(|s| s.cursor.is_streaming)
    }

    pub fn create_session(&self) -> String {
        self.mutate(|s| s.create_session())
    }

    pub fn set_current_session(&self, id: Option<&str>) {
        self.mutate(|s| s.set_current_session(id))
    }

    pub fn update_session_id(&self, old_id: &str, new_id: &str) {
        self.mutate(|s| s.update_session_id(old_id, new_id))
    }

    pub fn clear_session(&self, id: &str) {
        self.mutate(|s| s.clear_session(id))
    }

    pub fn clear_all_sessions(&self) {
        self.mutate(|s| s.clear_all_sessions())
    }

    pub fn add_message(&self, input: NewMessage) -> String {
        self.mutate(|s| s.add_message(input))
    }

    pub fn update_message(&self, session_id: &str, message_id: &str, patch: MessagePatch) {
        self.mutate(|s| s.update_message(session_id, message_id, patch))
    }

    pub fn set_message_tool_trace(&self, session_id: &str, message_id: &str, trace: Vec<ToolTrace>) {
        self.mutate(|s| s.set_message_tool_trace(session_id, message_id, trace))
    }

    pub fn set_message_metadata(&self, session_id: &str, message_id: &str, metadata: MessageMetadata) {
        self.mutate(|s| s.set_message_metadata(session_id, message_id, metadata))
    }

    pub fn start_streaming(&self, session_id: &str) -> Result<String> {
        self.mutate(|s| s.start_streaming(session_id))
    }

    pub fn begin_exchange(&self, user: NewMessage) -> Result<String> {
        self.mutate(|s| s.begin_exchange(user))
    }

    pub fn append_streaming_content(&self, token: &str) {
        self.mutate(|s| s.append_streaming_content(token))
    }

    pub fn complete_streaming(&self, final_content: Option<&str>) {
        self.mutate(|s| s.complete_streaming(final_content))
    }

    pub fn cancel_streaming(&self) {
        self.mutate(|s| s.cancel_streaming())
    }

    pub fn set_streaming_error(&self, error_message: &str) {
        self.mutate(|s| s.set_streaming_error(error_message))
    }

    /// 持久化投影
    pub fn to_persisted(&self) -> PersistedChat {
        self.read(|s| s.to_persisted())
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
