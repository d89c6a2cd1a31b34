//! 配置

use std::path::PathBuf;
use std::time::Duration;

/// Chat Store 容量配置
///
/// 内存与持久化快照共用同一组上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// 最多保留的会话数（最新优先）
    pub max_sessions: usize,
    /// 每个会话最多保留的消息数（FIFO 淘汰最旧的）
    pub max_messages_per_session: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_messages_per_session: 200,
        }
    }
}

/// 离线队列配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// 重试上限，达到后条目被丢弃
    pub max_attempts: u32,
    /// 同步错误环形缓冲区容量
    pub max_sync_errors: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_sync_errors: 10,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API 根地址，例如 `https://api.example.com/api/v1`
    pub base_url: String,
    /// 非流式请求的总超时
    pub request_timeout: Duration,
    /// 流式响应的空闲超时（两次数据块之间），`None` 表示不限制
    pub stream_idle_timeout: Option<Duration>,
    /// 适配器与消费者之间事件通道的容量
    pub event_buffer: usize,
    /// 数据目录（默认 ~/.coach）
    pub data_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".coach");

        Self {
            base_url: "http://localhost:8000/api/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: Some(Duration::from_secs(60)),
            event_buffer: 64,
            data_dir,
        }
    }
}

impl ClientConfig {
    /// 创建指定根地址的配置
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// 从环境变量创建配置
    ///
    /// - `COACH_API_URL`
    /// - `COACH_REQUEST_TIMEOUT_SECS`
    /// - `COACH_STREAM_IDLE_TIMEOUT_SECS`（0 表示关闭空闲超时）
    pub fn from_env() -> Self {
        let mut config = match std::env::var("COACH_API_URL") {
            Ok(url) => Self::new(&url),
            Err(_) => Self::default(),
        };

        if let Some(secs) = env_secs("COACH_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_secs("COACH_STREAM_IDLE_TIMEOUT_SECS") {
            config.stream_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    /// 设置空闲超时
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// 流式对话端点
    pub fn stream_url(&self) -> String {
        format!("{}/coach/chat/stream", self.base_url)
    }

    /// 非流式对话端点
    pub fn chat_url(&self) -> String {
        format!("{}/coach/chat", self.base_url)
    }

    /// 本地状态库路径
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("coach-state.db")
    }
}

fn env_secs(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(secs) => Some(secs),
            Err(_) => {
                tracing::warn!("忽略无效的 {}: {:?}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
