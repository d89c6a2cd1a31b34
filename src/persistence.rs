//! 本地持久化
//!
//! 一张 `kv_store` 表，每个 Store 一条版本化 JSON。
//! 写入的是内存状态的投影：游标和 `is_syncing` 都不落盘。

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::{QueueConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::queue::{CheckInDraft, NutritionDraft, OfflineQueue, PendingItem, QueueState};
use crate::store::{ChatState, ChatStore, PersistedChat, PERSIST_VERSION};
use crate::types::current_time_ms;

/// 对话 Store 的键
pub const CHAT_STORE_KEY: &str = "coach-chat-store";
/// 离线队列的键
pub const QUEUE_KEY: &str = "offline-sync-queue";

const KV_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);
"#;

/// 键值存储
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite 键值存储
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// 打开（或创建）数据库文件
    pub fn connect(path: &Path) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(KV_SCHEMA_SQL)?;
        tracing::info!("状态库已连接: {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(KV_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, current_time_ms()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// 内存键值存储
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ==================== Chat Store ====================

/// 保存对话 Store
pub fn save_chat(kv: &dyn KeyValueStore, store: &ChatStore) -> Result<()> {
    let persisted = store.to_persisted();
    let json = serde_json::to_string(&persisted)?;
    kv.set(CHAT_STORE_KEY, &json)?;
    tracing::debug!("对话已保存: sessions={}", persisted.sessions.len());
    Ok(())
}

/// 恢复对话 Store，没有存档时返回空 Store
pub fn rehydrate_chat(kv: &dyn KeyValueStore, config: StoreConfig) -> Result<ChatStore> {
    let Some(json) = kv.get(CHAT_STORE_KEY)? else {
        return Ok(ChatStore::new(config));
    };

    let persisted: PersistedChat = serde_json::from_str(&json)?;
    if persisted.version > PERSIST_VERSION {
        return Err(Error::Config(format!(
            "对话存档版本 {} 高于支持的版本 {}",
            persisted.version, PERSIST_VERSION
        )));
    }

    tracing::info!("恢复对话: sessions={}", persisted.sessions.len());
    Ok(ChatStore::from_state(ChatState::from_persisted(
        config, persisted,
    )))
}

// ==================== Offline Queue ====================

/// 队列持久化快照（不含 is_syncing）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub version: u32,
    #[serde(default)]
    pub check_ins: Vec<PendingItem<CheckInDraft>>,
    #[serde(default)]
    pub nutrition: Vec<PendingItem<NutritionDraft>>,
    #[serde(default)]
    pub sync_errors: VecDeque<String>,
    #[serde(default)]
    pub last_sync_at: Option<i64>,
}

impl From<QueueState> for PersistedQueue {
    fn from(state: QueueState) -> Self {
        Self {
            version: PERSIST_VERSION,
            check_ins: state.check_ins,
            nutrition: state.nutrition,
            sync_errors: state.sync_errors,
            last_sync_at: state.last_sync_at,
        }
    }
}

impl From<PersistedQueue> for QueueState {
    fn from(persisted: PersistedQueue) -> Self {
        Self {
            check_ins: persisted.check_ins,
            nutrition: persisted.nutrition,
            sync_errors: persisted.sync_errors,
            is_syncing: false,
            last_sync_at: persisted.last_sync_at,
        }
    }
}

/// 保存离线队列
pub fn save_queue(kv: &dyn KeyValueStore, queue: &OfflineQueue) -> Result<()> {
    let persisted = PersistedQueue::from(queue.snapshot());
    let json = serde_json::to_string(&persisted)?;
    kv.set(QUEUE_KEY, &json)
}

/// 恢复离线队列
pub fn rehydrate_queue(kv: &dyn KeyValueStore, config: QueueConfig) -> Result<OfflineQueue> {
    let Some(json) = kv.get(QUEUE_KEY)? else {
        return Ok(OfflineQueue::new(config));
    };

    let persisted: PersistedQueue = serde_json::from_str(&json)?;
    if persisted.version > PERSIST_VERSION {
        return Err(Error::Config(format!(
            "队列存档版本 {} 高于支持的版本 {}",
            persisted.version, PERSIST_VERSION
        )));
    }

    Ok(OfflineQueue::from_state(config, persisted.into()))
}
