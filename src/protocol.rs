//! 协议定义
//!
//! - 对话请求/响应（HTTP JSON）
//! - 流式事件（SSE，每帧一行 `data: <json>`）
//! - Store 变更事件（推送给订阅者）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DataGap, MessageMetadata, ToolTrace};

/// 对话请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: &str, session_id: Option<&str>) -> Self {
        Self {
            message: message.to_string(),
            session_id: session_id.map(str::to_string),
        }
    }
}

/// 非流式对话响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub session_id: String,
    #[serde(default)]
    pub tool_trace: Option<Vec<ToolTrace>>,
    pub confidence: f64,
    #[serde(default)]
    pub data_gaps: Option<Vec<DataGap>>,
    #[serde(default)]
    pub disclaimers: Option<Vec<String>>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl ChatResponse {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            confidence: Some(self.confidence),
            data_gaps: self.data_gaps.clone(),
            disclaimers: self.disclaimers.clone(),
        }
    }
}

/// 终止成功事件携带的数据
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DonePayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub data_gaps: Option<Vec<DataGap>>,
    #[serde(default)]
    pub disclaimers: Option<Vec<String>>,
}

impl DonePayload {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            confidence: self.confidence,
            data_gaps: self.data_gaps.clone(),
            disclaimers: self.disclaimers.clone(),
        }
    }
}

/// 流式事件（适配器输出）
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 文本片段
    Token(String),
    /// 工具开始执行
    ToolStart { tool: String },
    /// 工具执行结束
    ToolEnd {
        tool: String,
        success: bool,
        latency_ms: u64,
    },
    /// 终止：成功
    Done(DonePayload),
    /// 终止：失败
    Error { message: String },
}

impl StreamEvent {
    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error { .. })
    }

    /// 事件名（与 wire 格式的 type 一致）
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token(_) => event_type::TOKEN,
            StreamEvent::ToolStart { .. } => event_type::TOOL_START,
            StreamEvent::ToolEnd { .. } => event_type::TOOL_END,
            StreamEvent::Done(_) => event_type::DONE,
            StreamEvent::Error { .. } => event_type::ERROR,
        }
    }
}

/// 已知的流事件类型常量
pub mod event_type {
    pub const TOKEN: &str = "token";
    pub const TOOL_START: &str = "tool_start";
    pub const TOOL_END: &str = "tool_end";
    pub const DONE: &str = "done";
    pub const ERROR: &str = "error";
}

/// SSE 帧中的原始 JSON
///
/// `data` 为字符串或对象，取决于事件类型。
#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
struct ToolStartData {
    tool: String,
}

#[derive(Deserialize)]
struct ToolEndData {
    tool: String,
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    latency_ms: u64,
}

fn default_true() -> bool {
    true
}

impl WireEvent {
    /// 转换为类型化事件；未知类型或 data 结构不符返回 `None`
    pub fn into_event(self) -> Option<StreamEvent> {
        match self.event_type.as_str() {
            event_type::TOKEN => match self.data {
                Value::String(text) => Some(StreamEvent::Token(text)),
                _ => None,
            },
            event_type::TOOL_START => serde_json::from_value::<ToolStartData>(self.data)
                .ok()
                .map(|d| StreamEvent::ToolStart { tool: d.tool }),
            event_type::TOOL_END => serde_json::from_value::<ToolEndData>(self.data)
                .ok()
                .map(|d| StreamEvent::ToolEnd {
                    tool: d.tool,
                    success: d.success,
                    latency_ms: d.latency_ms,
                }),
            event_type::DONE => {
                let payload = match self.data {
                    Value::Object(_) => serde_json::from_value(self.data).unwrap_or_default(),
                    _ => DonePayload::default(),
                };
                Some(StreamEvent::Done(payload))
            }
            event_type::ERROR => Some(StreamEvent::Error {
                message: error_text(&self.data)
                    .unwrap_or_else(|| GENERIC_STREAM_ERROR.to_string()),
            }),
            _ => None,
        }
    }
}

/// 服务端错误的兜底提示
pub const GENERIC_STREAM_ERROR: &str = "Something went wrong. Please try again.";

/// 传输中断的提示（具体原因对用户无意义，统一处理）
pub const CONNECTION_LOST_ERROR: &str =
    "Connection lost. Please check your connection and try again.";

/// 空闲超时的提示
pub const IDLE_TIMEOUT_ERROR: &str = "The coach stopped responding. Please try again.";

/// 从 `"msg"`、`{"message": ..}` 或 `{"detail": ..}` 中提取错误文本
pub fn error_text(data: &Value) -> Option<String> {
    match data {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => ["message", "detail", "error"]
            .iter()
            .find_map(|key| map.get(*key).and_then(error_text)),
        _ => None,
    }
}

/// Store 变更事件（推送给订阅者）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// 会话列表或当前会话指针变化
    SessionsChanged,
    /// 某个会话的消息变化
    MessagesChanged { session_id: String },
    /// 流式状态变化
    StreamingChanged { is_streaming: bool },
    /// 离线队列变化
    QueueChanged { pending: usize },
}

/// 事件类型（用于订阅过滤）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Sessions,
    Messages,
    Streaming,
    Queue,
}

impl EventType {
    pub fn all() -> Vec<EventType> {
        vec![
            EventType::Sessions,
            EventType::Messages,
            EventType::Streaming,
            EventType::Queue,
        ]
    }
}

impl StoreEvent {
    /// 获取事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            StoreEvent::SessionsChanged => EventType::Sessions,
            StoreEvent::MessagesChanged { .. } => EventType::Messages,
            StoreEvent::StreamingChanged { .. } => EventType::Streaming,
            StoreEvent::QueueChanged { .. } => EventType::Queue,
        }
    }
}
