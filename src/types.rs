//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 本地生成的会话 ID 前缀（服务端分配 ID 之前使用）
pub const LOCAL_SESSION_PREFIX: &str = "local-";

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Complete,
    Streaming,
    Error,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Complete => write!(f, "complete"),
            MessageStatus::Streaming => write!(f, "streaming"),
            MessageStatus::Error => write!(f, "error"),
        }
    }
}

/// 工具调用轨迹（可解释性）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolTrace {
    pub tool_name: String,
    #[serde(default)]
    pub tool_description: String,
    #[serde(default)]
    pub input_summary: String,
    #[serde(default)]
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_citations: Option<Vec<String>>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cached: bool,
}

/// 缺失数据提示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGap {
    pub field: String,
    pub description: String,
    pub suggestion: String,
}

/// 会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub last_message_at: i64,
    pub message_count: u64,
}

impl Session {
    /// 是否为本地生成、尚未被服务端确认的会话
    pub fn is_local(&self) -> bool {
        is_local_session_id(&self.id)
    }
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_trace: Option<Vec<ToolTrace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_gaps: Option<Vec<DataGap>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disclaimers: Option<Vec<String>>,
}

/// 新消息输入（ID 由 store 分配）
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
    pub status: MessageStatus,
}

impl NewMessage {
    /// 用户消息（当前时间，状态 complete）
    pub fn user(session_id: &str, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: current_time_ms(),
            status: MessageStatus::Complete,
        }
    }

    /// 助手消息（当前时间，状态 complete）
    pub fn assistant(session_id: &str, content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            ..Self::user(session_id, content)
        }
    }

    pub(crate) fn into_message(self, id: String) -> Message {
        Message {
            id,
            session_id: self.session_id,
            role: self.role,
            content: self.content,
            timestamp: self.timestamp,
            status: self.status,
            error_message: None,
            tool_trace: None,
            confidence: None,
            data_gaps: None,
            disclaimers: None,
        }
    }
}

/// 消息的部分更新，`None` 字段保持不变
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub error_message: Option<String>,
    pub tool_trace: Option<Vec<ToolTrace>>,
    pub confidence: Option<f64>,
    pub data_gaps: Option<Vec<DataGap>>,
    pub disclaimers: Option<Vec<String>>,
}

impl MessagePatch {
    pub(crate) fn apply(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(status) = self.status {
            message.status = status;
        }
        if self.error_message.is_some() {
            message.error_message = self.error_message;
        }
        if self.tool_trace.is_some() {
            message.tool_trace = self.tool_trace;
        }
        if self.confidence.is_some() {
            message.confidence = self.confidence;
        }
        if self.data_gaps.is_some() {
            message.data_gaps = self.data_gaps;
        }
        if self.disclaimers.is_some() {
            message.disclaimers = self.disclaimers;
        }
    }
}

/// 流结束后补充的元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub confidence: Option<f64>,
    pub data_gaps: Option<Vec<DataGap>>,
    pub disclaimers: Option<Vec<String>>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.confidence.is_none() && self.data_gaps.is_none() && self.disclaimers.is_none()
    }
}

/// 流式游标（全局唯一）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingCursor {
    pub content: String,
    pub is_streaming: bool,
    pub message_id: Option<String>,
}

/// 生成本地会话 ID
pub fn new_local_session_id() -> String {
    format!("{}{}", LOCAL_SESSION_PREFIX, uuid::Uuid::new_v4())
}

/// 是否为本地会话 ID
pub fn is_local_session_id(id: &str) -> bool {
    id.starts_with(LOCAL_SESSION_PREFIX)
}

/// 当前时间（毫秒）
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
