//! 离线同步队列
//!
//! 待同步的打卡与营养记录。每个条目带重试计数，达到上限即永久丢弃，
//! 用少量数据丢失换取队列健康。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bounds;
use crate::broadcaster::{Broadcaster, SubscriberId};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::protocol::{EventType, StoreEvent};
use crate::types::current_time_ms;

/// 本地条目 ID 前缀，与服务端 ID 区分
pub const LOCAL_ID_PREFIX: &str = "local_";

/// 是否为本地生成、尚未被服务端确认的 ID
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

/// 打卡草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInDraft {
    pub date: NaiveDate,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub energy_level: Option<u8>,
    #[serde(default)]
    pub sleep_quality: Option<u8>,
    #[serde(default)]
    pub mood: Option<u8>,
    pub client_updated_at: DateTime<Utc>,
}

/// 营养记录草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionDraft {
    pub date: NaiveDate,
    #[serde(default)]
    pub calories: Option<u32>,
    #[serde(default)]
    pub protein_g: Option<f64>,
    #[serde(default)]
    pub carbs_g: Option<f64>,
    #[serde(default)]
    pub fat_g: Option<f64>,
    #[serde(default)]
    pub fiber_g: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// 待同步条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem<T> {
    pub local_id: String,
    pub data: T,
    pub attempts: u32,
    pub created_at: i64,
}

impl<T> PendingItem<T> {
    fn new(data: T) -> Self {
        Self {
            local_id: new_local_id(),
            data,
            attempts: 0,
            created_at: current_time_ms(),
        }
    }
}

/// 重试计数结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 保留，携带当前次数
    Retained(u32),
    /// 达到上限被丢弃
    Dropped,
    /// 未找到
    NotFound,
}

/// 队列状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub check_ins: Vec<PendingItem<CheckInDraft>>,
    pub nutrition: Vec<PendingItem<NutritionDraft>>,
    pub sync_errors: VecDeque<String>,
    #[serde(skip)]
    pub is_syncing: bool,
    #[serde(default)]
    pub last_sync_at: Option<i64>,
}

impl QueueState {
    pub fn pending_count(&self) -> usize {
        self.check_ins.len() + self.nutrition.len()
    }
}

/// 同步后端（check-in / nutrition 接口）
pub trait SyncBackend: Send + Sync {
    fn push_check_in(&self, draft: &CheckInDraft) -> impl Future<Output = Result<()>> + Send;
    fn push_nutrition(&self, draft: &NutritionDraft) -> impl Future<Output = Result<()>> + Send;
}

/// 一轮同步的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// 离线队列
pub struct OfflineQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    broadcaster: Arc<Broadcaster>,
}

impl OfflineQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::from_state(config, QueueState::default())
    }

    /// 由已有状态创建（用于恢复）
    pub fn from_state(config: QueueConfig, mut state: QueueState) -> Self {
        state.is_syncing = false;
        let mut errors: Vec<String> = state.sync_errors.drain(..).collect();
        bounds::keep_most_recent(&mut errors, config.max_sync_errors);
        state.sync_errors = errors.into();

        Self {
            config,
            state: Mutex::new(state),
            broadcaster: Broadcaster::new(),
        }
    }

    /// 订阅变更
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<StoreEvent>) {
        self.broadcaster.subscribe(vec![EventType::Queue])
    }

    pub fn snapshot(&self) -> QueueState {
        self.state.lock().clone()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let (result, pending) = {
            let mut state = self.state.lock();
            let result = f(&mut *state);
            (result, state.pending_count())
        };
        self.broadcaster.broadcast(StoreEvent::QueueChanged { pending });
        result
    }

    /// 加入待同步打卡，返回本地 ID
    pub fn add_pending_check_in(&self, data: CheckInDraft) -> String {
        let item = PendingItem::new(data);
        let id = item.local_id.clone();
        self.mutate(|s| s.check_ins.push(item));
        tracing::debug!("加入待同步打卡: {}", id);
        id
    }

    /// 加入待同步营养记录，返回本地 ID
    pub fn add_pending_nutrition(&self, data: NutritionDraft) -> String {
        let item = PendingItem::new(data);
        let id = item.local_id.clone();
        self.mutate(|s| s.nutrition.push(item));
        tracing::debug!("加入待同步营养记录: {}", id);
        id
    }

    pub fn remove_pending_check_in(&self, local_id: &str) {
        self.mutate(|s| s.check_ins.retain(|i| i.local_id != local_id));
    }

    pub fn remove_pending_nutrition(&self, local_id: &str) {
        self.mutate(|s| s.nutrition.retain(|i| i.local_id != local_id));
    }

    /// 重试计数 +1，达到上限时移除条目
    pub fn increment_attempts(&self, local_id: &str) -> AttemptOutcome {
        let max = self.config.max_attempts;
        let outcome = self.mutate(|s| {
            let outcome = bump(&mut s.check_ins, local_id, max);
            if outcome != AttemptOutcome::NotFound {
                return outcome;
            }
            bump(&mut s.nutrition, local_id, max)
        });

        if outcome == AttemptOutcome::Dropped {
            tracing::warn!("同步重试 {} 次仍失败，丢弃条目: {}", max, local_id);
        }
        outcome
    }

    /// 记录同步错误（环形缓冲，超出容量淘汰最旧的）
    pub fn add_sync_error(&self, message: &str) {
        let cap = self.config.max_sync_errors;
        self.mutate(|s| {
            s.sync_errors.push_back(message.to_string());
            while s.sync_errors.len() > cap {
                s.sync_errors.pop_front();
            }
        });
    }

    pub fn sync_errors(&self) -> Vec<String> {
        self.state.lock().sync_errors.iter().cloned().collect()
    }

    /// 待同步条目总数
    pub fn get_pending_count(&self) -> usize {
        self.state.lock().pending_count()
    }

    /// 清空两类条目与错误缓冲（不影响 is_syncing / last_sync_at）
    pub fn clear_all_pending(&self) {
        self.mutate(|s| {
            s.check_ins.clear();
            s.nutrition.clear();
            s.sync_errors.clear();
        });
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.mutate(|s| s.is_syncing = syncing);
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().is_syncing
    }

    pub fn mark_synced(&self, at: i64) {
        self.mutate(|s| s.last_sync_at = Some(at));
    }

    /// 执行一轮同步
    ///
    /// 成功的条目移除；失败的记录错误并计数，达到上限的被丢弃。
    /// 已在同步中时直接返回空报告。
    pub async fn sync_pending<B: SyncBackend>(&self, backend: &B) -> SyncReport {
        let (check_ins, nutrition) = {
            let mut state = self.state.lock();
            if state.is_syncing {
                tracing::debug!("同步进行中，跳过");
                return SyncReport::default();
            }
            state.is_syncing = true;
            (state.check_ins.clone(), state.nutrition.clone())
        };
        // 本轮被中途丢弃（超时、任务取消）时也要复位 is_syncing
        let _syncing = SyncingGuard { queue: self };
        tracing::info!(
            "开始同步: check_ins={}, nutrition={}",
            check_ins.len(),
            nutrition.len()
        );

        let mut report = SyncReport::default();

        for item in check_ins {
            match backend.push_check_in(&item.data).await {
                Ok(()) => {
                    self.remove_pending_check_in(&item.local_id);
                    report.synced += 1;
                }
                Err(e) => {
                    let message = format!("Check-in {}: {}", item.data.date, e);
                    self.record_failure(&item.local_id, &message, &mut report);
                }
            }
        }

        for item in nutrition {
            match backend.push_nutrition(&item.data).await {
                Ok(()) => {
                    self.remove_pending_nutrition(&item.local_id);
                    report.synced += 1;
                }
                Err(e) => {
                    let message = format!("Nutrition {}: {}", item.data.date, e);
                    self.record_failure(&item.local_id, &message, &mut report);
                }
            }
        }

        self.mutate(|s| s.last_sync_at = Some(current_time_ms()));
        tracing::info!(
            "同步完成: synced={}, failed={}, dropped={}",
            report.synced,
            report.failed,
            report.dropped
        );
        report
    }

    fn record_failure(&self, local_id: &str, message: &str, report: &mut SyncReport) {
        self.add_sync_error(message);
        report.failed += 1;
        if self.increment_attempts(local_id) == AttemptOutcome::Dropped {
            report.dropped += 1;
        }
    }
}

/// 同步标志守卫，离开作用域时清除 `is_syncing`
struct SyncingGuard<'a> {
    queue: &'a OfflineQueue,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.queue.mutate(|s| s.is_syncing = false);
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

fn bump<T>(items: &mut Vec<PendingItem<T>>, local_id: &str, max: u32) -> AttemptOutcome {
    let Some(pos) = items.iter().position(|i| i.local_id == local_id) else {
        return AttemptOutcome::NotFound;
    };
    items[pos].attempts += 1;
    let attempts = items[pos].attempts;
    if attempts >= max {
        items.remove(pos);
        AttemptOutcome::Dropped
    } else {
        AttemptOutcome::Retained(attempts)
    }
}
