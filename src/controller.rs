//! 对话控制器
//!
//! UI 面向的 `send_message` / `cancel`：打开流、逐个事件驱动 Store 状态转换。
//! 取消由同一个 UI 动作协调两边（关闭连接 + `cancel_streaming`），
//! 适配器本身不会修改 Store。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{ChatRequest, StreamEvent, CONNECTION_LOST_ERROR};
use crate::store::ChatStore;
use crate::transport::{CancelHandle, ChatStream, ChatTransport};
use crate::types::{is_local_session_id, MessagePatch, MessageStatus, NewMessage, ToolTrace};

/// 非流式请求超时的提示
pub const TIMEOUT_ERROR: &str = "The request timed out. Please try again.";

/// 一次发送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Completed,
    /// 失败，携带展示给用户的错误文本
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// 最终的会话 ID（服务端分配后会与发送时不同）
    pub session_id: String,
    /// 助手消息 ID
    pub message_id: String,
    pub status: SendStatus,
}

/// 对话控制器
pub struct ChatController<T: ChatTransport> {
    store: Arc<ChatStore>,
    transport: T,
    active: Mutex<Option<CancelHandle>>,
}

impl<T: ChatTransport> ChatController<T> {
    pub fn new(store: Arc<ChatStore>, transport: T) -> Self {
        Self {
            store,
            transport,
            active: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 发送消息并流式接收回复
    ///
    /// 已有活跃流时拒绝（`Error::StreamAlreadyActive`），不排队也不取消前一个。
    pub async fn send_message(&self, text: &str, session_id: Option<&str>) -> Result<SendOutcome> {
        if self.store.is_streaming() {
            return Err(Error::StreamAlreadyActive);
        }

        let mut working = self.resolve_session(session_id);
        // 流是惰性的，打开时不发请求。
        // 写入用户消息、进入 streaming、登记取消句柄在同一临界区内完成，
        // cancel() 不会落在三者之间。
        let mut stream = self.transport.open_stream(self.request_for(text, &working));
        let message_id = {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(Error::StreamAlreadyActive);
            }
            let message_id = self.store.begin_exchange(NewMessage::user(&working, text))?;
            *active = Some(stream.cancel_handle());
            message_id
        };
        tracing::info!("发送消息: session={}, message={}", working, message_id);

        let status = self.drive(&mut stream, &mut working, &message_id).await;
        self.active.lock().take();

        tracing::info!("回复结束: session={}, status={:?}", working, status);
        Ok(SendOutcome {
            session_id: working,
            message_id,
            status,
        })
    }

    /// 取消当前流（幂等）
    pub fn cancel(&self) {
        if let Some(handle) = self.active.lock().take() {
            handle.cancel();
        }
        self.store.cancel_streaming();
    }

    /// 是否有进行中的请求
    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    /// 非流式发送：一次请求拿到完整回复和元数据
    pub async fn send_message_once(&self, text: &str, session_id: Option<&str>) -> Result<SendOutcome> {
        if self.store.is_streaming() {
            return Err(Error::StreamAlreadyActive);
        }

        let mut working = self.resolve_session(session_id);
        self.store.add_message(NewMessage::user(&working, text));

        let response = match self.transport.chat(self.request_for(text, &working)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("对话请求失败: {}", e);
                let message = user_facing_error(&e);
                let message_id = self.store.add_message(NewMessage {
                    status: MessageStatus::Error,
                    ..NewMessage::assistant(&working, "")
                });
                self.store.update_message(
                    &working,
                    &message_id,
                    MessagePatch {
                        error_message: Some(message.clone()),
                        ..Default::default()
                    },
                );
                return Ok(SendOutcome {
                    session_id: working,
                    message_id,
                    status: SendStatus::Failed(message),
                });
            }
        };

        if response.session_id != working {
            self.store.update_session_id(&working, &response.session_id);
            working = response.session_id.clone();
        }

        let message_id = self
            .store
            .add_message(NewMessage::assistant(&working, &response.message));
        if let Some(trace) = response.tool_trace.clone() {
            self.store.set_message_tool_trace(&working, &message_id, trace);
        }
        self.store
            .set_message_metadata(&working, &message_id, response.metadata());

        Ok(SendOutcome {
            session_id: working,
            message_id,
            status: SendStatus::Completed,
        })
    }

    /// 指定会话 → 当前会话 → 新建会话
    fn resolve_session(&self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => {
                if self.store.current_session_id().as_deref() != Some(id) {
                    self.store.set_current_session(Some(id));
                }
                id.to_string()
            }
            None => self
                .store
                .current_session_id()
                .unwrap_or_else(|| self.store.create_session()),
        }
    }

    /// 本地生成的会话 ID 服务端不认识，不随请求发送
    fn request_for(&self, text: &str, session_id: &str) -> ChatRequest {
        let known = (!is_local_session_id(session_id)).then_some(session_id);
        ChatRequest::new(text, known)
    }

    async fn drive(&self, stream: &mut ChatStream, working: &mut String, message_id: &str) -> SendStatus {
        let mut traces: Vec<ToolTrace> = Vec::new();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Token(token) => {
                    self.store.append_streaming_content(&token);
                }
                StreamEvent::ToolStart { tool } => {
                    tracing::debug!("🔧 tool_start: {}", tool);
                    traces.push(ToolTrace {
                        tool_name: tool,
                        ..Default::default()
                    });
                    self.store
                        .set_message_tool_trace(working, message_id, traces.clone());
                }
                StreamEvent::ToolEnd {
                    tool,
                    success,
                    latency_ms,
                } => {
                    tracing::debug!("🔧 tool_end: {} success={} ({}ms)", tool, success, latency_ms);
                    match traces.iter_mut().rev().find(|t| t.tool_name == tool) {
                        Some(trace) => {
                            trace.latency_ms = latency_ms;
                            trace.output_summary = tool_summary(success);
                        }
                        None => traces.push(ToolTrace {
                            tool_name: tool,
                            latency_ms,
                            output_summary: tool_summary(success),
                            ..Default::default()
                        }),
                    }
                    self.store
                        .set_message_tool_trace(working, message_id, traces.clone());
                }
                StreamEvent::Done(payload) => {
                    // 改名必须先于后续任何按会话 ID 的查找
                    if let Some(server_id) = payload.session_id.as_deref() {
                        if server_id != working.as_str() {
                            self.store.update_session_id(working, server_id);
                            *working = server_id.to_string();
                        }
                    }
                    let metadata = payload.metadata();
                    if !metadata.is_empty() {
                        self.store.set_message_metadata(working, message_id, metadata);
                    }
                    self.store.complete_streaming(None);
                    return SendStatus::Completed;
                }
                StreamEvent::Error { message } => {
                    self.store.set_streaming_error(&message);
                    return SendStatus::Failed(message);
                }
            }
        }

        if stream.cancel_handle().is_cancelled() {
            self.store.cancel_streaming();
            SendStatus::Cancelled
        } else {
            self.store.set_streaming_error(CONNECTION_LOST_ERROR);
            SendStatus::Failed(CONNECTION_LOST_ERROR.to_string())
        }
    }
}

fn tool_summary(success: bool) -> String {
    if success { "ok" } else { "failed" }.to_string()
}

/// 错误转换为展示给用户的文本
pub fn user_facing_error(error: &Error) -> String {
    match error {
        Error::Timeout(_) => TIMEOUT_ERROR.to_string(),
        Error::Api { detail, .. } => detail.clone(),
        _ => CONNECTION_LOST_ERROR.to_string(),
    }
}
