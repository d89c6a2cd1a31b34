//! 流式传输适配器
//!
//! 网络字节流（push）→ SSE 解码 → 有界 mpsc 通道 → `ChatStream::next()`（pull）
//!
//! - 惰性：首次 `next()` 才发出请求
//! - 有限且不可重启：收到 done/error 后立即结束并释放连接
//! - 传输层/解析错误全部在这里吸收，转换为终止的 `Error` 事件
//! - 取消：`CancelHandle::cancel()` 关闭连接，`next()` 随即返回 `None`，
//!   已在通道中的事件被丢弃

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    error_text, ChatRequest, ChatResponse, StreamEvent, CONNECTION_LOST_ERROR,
    GENERIC_STREAM_ERROR, IDLE_TIMEOUT_ERROR,
};
use crate::sse::SseDecoder;

/// 访问令牌提供者（外部认证存储）
///
/// 每次请求时读取，不负责刷新。
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// 固定令牌
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// 对话传输接口
pub trait ChatTransport: Send + Sync {
    /// 打开流式对话
    fn open_stream(&self, request: ChatRequest) -> ChatStream;

    /// 非流式对话
    fn chat(&self, request: ChatRequest) -> impl Future<Output = Result<ChatResponse>> + Send;
}

/// 取消句柄（可克隆，交给 UI 持有）
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// 取消（幂等）
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            tracing::debug!("流式请求已取消");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

type Producer = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 流式事件序列
pub struct ChatStream {
    producer: Option<Producer>,
    task: Option<JoinHandle<()>>,
    receiver: mpsc::Receiver<StreamEvent>,
    cancel_rx: watch::Receiver<bool>,
    cancel: CancelHandle,
    finished: bool,
}

impl ChatStream {
    fn with_producer<F, Fut>(buffer: usize, make: F) -> Self
    where
        F: FnOnce(mpsc::Sender<StreamEvent>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, receiver) = mpsc::channel(buffer.max(1));
        let (cancel, cancel_rx) = CancelHandle::new();
        let producer = make(tx, cancel_rx.clone());

        Self {
            producer: Some(Box::pin(producer)),
            task: None,
            receiver,
            cancel_rx,
            cancel,
            finished: false,
        }
    }

    /// 从任意字节流构建（HTTP 响应体，或测试中的内存数据）
    pub fn from_byte_stream<S, B, E>(bytes: S, idle_timeout: Option<Duration>, buffer: usize) -> Self
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        Self::with_producer(buffer, move |tx, cancel_rx| {
            pump(bytes, tx, cancel_rx, idle_timeout)
        })
    }

    /// 只产出一个 `Error` 事件的流
    pub fn failed(message: &str) -> Self {
        let event = StreamEvent::Error {
            message: message.to_string(),
        };
        Self::with_producer(1, move |tx, _| async move {
            let _ = tx.send(event).await;
        })
    }

    /// 获取取消句柄
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 取消
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 拉取下一个事件；终止事件之后、取消之后均返回 `None`
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish();
            return None;
        }

        if let Some(producer) = self.producer.take() {
            self.task = Some(tokio::spawn(producer));
        }

        let event = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => None,
            event = self.receiver.recv() => event,
        };

        match event {
            Some(event) if !self.cancel.is_cancelled() => {
                if event.is_terminal() {
                    self.finish();
                }
                Some(event)
            }
            _ => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.producer = None;
        self.receiver.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 等待取消信号；发送端不存在时永不返回
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn with_idle_timeout<F: Future>(
    idle_timeout: Option<Duration>,
    fut: F,
) -> std::result::Result<F::Output, tokio::time::error::Elapsed> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}

/// 转发事件，返回是否应停止
async fn forward(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    let terminal = event.is_terminal();
    tracing::trace!("stream event: {}", event.kind());
    tx.send(event).await.is_err() || terminal
}

async fn fail(tx: &mpsc::Sender<StreamEvent>, message: &str) {
    let _ = tx
        .send(StreamEvent::Error {
            message: message.to_string(),
        })
        .await;
}

/// 读取字节流并产出事件
///
/// 返回即丢弃字节流，底层连接随之关闭。
async fn pump<S, B, E>(
    bytes: S,
    tx: mpsc::Sender<StreamEvent>,
    mut cancel_rx: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
) where
    S: Stream<Item = std::result::Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let mut bytes = std::pin::pin!(bytes);
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => {
                tracing::debug!("读取中止: 已取消");
                return;
            }
            next = with_idle_timeout(idle_timeout, bytes.next()) => next,
        };

        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                tracing::warn!("流读取失败: {}", e);
                fail(&tx, CONNECTION_LOST_ERROR).await;
                return;
            }
            Ok(None) => {
                if let Some(event) = decoder.finish() {
                    if forward(&tx, event).await {
                        return;
                    }
                }
                tracing::warn!("流在终止事件之前结束");
                fail(&tx, CONNECTION_LOST_ERROR).await;
                return;
            }
            Err(_) => {
                tracing::warn!("流空闲超时: {:?}", idle_timeout);
                fail(&tx, IDLE_TIMEOUT_ERROR).await;
                return;
            }
        };

        for event in decoder.push(chunk.as_ref()) {
            if forward(&tx, event).await {
                return;
            }
        }
    }
}

/// 教练 API 客户端
#[derive(Clone)]
pub struct CoachClient {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl CoachClient {
    /// 创建客户端
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            config,
            tokens,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 流式对话（`POST /coach/chat/stream`）
    pub fn stream_chat(&self, request: ChatRequest) -> ChatStream {
        let mut builder = self
            .http
            .post(self.config.stream_url())
            .header(ACCEPT, "text/event-stream")
            .json(&request);
        if let Some(token) = self.tokens.access_token() {
            builder = builder.bearer_auth(token);
        }
        let idle_timeout = self.config.stream_idle_timeout;

        ChatStream::with_producer(self.config.event_buffer, move |tx, mut cancel_rx| async move {
            let response = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => return,
                response = with_idle_timeout(idle_timeout, builder.send()) => response,
            };

            let response = match response {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::warn!("流式请求失败: {}", e);
                    fail(&tx, CONNECTION_LOST_ERROR).await;
                    return;
                }
                Err(_) => {
                    tracing::warn!("流式请求连接超时");
                    fail(&tx, IDLE_TIMEOUT_ERROR).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let detail = error_detail(response).await;
                tracing::warn!("流式请求被拒绝: status={}, detail={}", status, detail);
                fail(&tx, &detail).await;
                return;
            }

            tracing::info!("流式响应开始: status={}", status);
            pump(response.bytes_stream(), tx, cancel_rx, idle_timeout).await;
        })
    }

    /// 非流式对话（`POST /coach/chat`），受 `request_timeout` 限制
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut builder = self
            .http
            .post(self.config.chat_url())
            .timeout(self.config.request_timeout)
            .json(&request);
        if let Some(token) = self.tokens.access_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                detail: error_detail(response).await,
            });
        }

        response.json().await.map_err(|e| self.map_error(e))
    }

    fn map_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.config.request_timeout)
        } else {
            Error::Http(e)
        }
    }
}

impl ChatTransport for CoachClient {
    fn open_stream(&self, request: ChatRequest) -> ChatStream {
        self.stream_chat(request)
    }

    fn chat(&self, request: ChatRequest) -> impl Future<Output = Result<ChatResponse>> + Send {
        CoachClient::chat(self, request)
    }
}

/// 读取错误响应体并提取展示文本
async fn error_detail(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    detail_from_body(&body)
}

/// 从错误响应体（`{"detail": ..}` 等）提取文本，无法识别时返回通用提示
pub fn detail_from_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| error_text(&value))
        .unwrap_or_else(|| GENERIC_STREAM_ERROR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let owned: Vec<_> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    async fn collect(mut stream: ChatStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_detail_from_body() {
        assert_eq!(detail_from_body(r#"{"detail":"Invalid token"}"#), "Invalid token");
        assert_eq!(detail_from_body(r#"{"message":"Slow down"}"#), "Slow down");
        assert_eq!(detail_from_body("<html>Bad Gateway</html>"), GENERIC_STREAM_ERROR);
        assert_eq!(detail_from_body(""), GENERIC_STREAM_ERROR);
    }

    #[tokio::test]
    async fn test_stops_at_done() {
        let stream = ChatStream::from_byte_stream(
            chunks(&[
                "data: {\"type\":\"token\",\"data\":\"a\"}\n\n",
                "data: {\"type\":\"done\",\"data\":{}}\n\ndata: {\"type\":\"token\",\"data\":\"b\"}\n\n",
            ]),
            None,
            8,
        );

        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Token("a".into()));
        assert!(matches!(events[1], StreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn test_read_error_becomes_terminal_error() {
        let parts: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"type\":\"token\",\"data\":\"a\"}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let events = collect(ChatStream::from_byte_stream(stream::iter(parts), None, 8)).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("a".into()),
                StreamEvent::Error {
                    message: CONNECTION_LOST_ERROR.into()
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_eof_without_terminal_is_error() {
        let events = collect(ChatStream::from_byte_stream(
            chunks(&["data: {\"type\":\"token\",\"data\":\"a\"}\n"]),
            None,
            8,
        ))
        .await;
        assert_eq!(events.last(), Some(&StreamEvent::Error {
            message: CONNECTION_LOST_ERROR.into()
        }));
    }

    #[tokio::test]
    async fn test_failed_stream_yields_single_error() {
        let events = collect(ChatStream::failed("Unauthorized")).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "Unauthorized".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_first_pull() {
        let mut stream = ChatStream::from_byte_stream(
            chunks(&["data: {\"type\":\"token\",\"data\":\"a\"}\n"]),
            None,
            8,
        );
        stream.cancel_handle().cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let stalled = chunks(&["data: {\"type\":\"token\",\"data\":\"a\"}\n"]).chain(stream::pending());
        let stream = ChatStream::from_byte_stream(stalled, Some(Duration::from_secs(5)), 8);

        let events = collect(stream).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("a".into()),
                StreamEvent::Error {
                    message: IDLE_TIMEOUT_ERROR.into()
                }
            ]
        );
    }
}
