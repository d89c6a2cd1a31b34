//! 错误类型定义

use std::time::Duration;

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 本地持久化错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// HTTP 错误
    #[cfg(feature = "transport")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 请求超时（与一般连接错误区分）
    #[error("请求超时 ({}s)", .0.as_secs())]
    Timeout(Duration),

    /// 服务端返回非 2xx
    #[error("API 错误 {status}: {detail}")]
    Api { status: u16, detail: String },

    /// 已有流式回复进行中
    #[error("已有流式回复进行中，拒绝新的请求")]
    StreamAlreadyActive,

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
