//! 变更广播器
//!
//! 维护订阅列表，将 Store 变更事件推送给订阅者（UI 只读订阅）

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{EventType, StoreEvent};

/// 订阅者 ID
pub type SubscriberId = u64;

/// 每个订阅者的通道容量
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    events: HashSet<EventType>,
    sender: mpsc::Sender<StoreEvent>,
}

/// 事件广播器
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: RwLock<SubscriberId>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 订阅事件，返回订阅 ID 和接收端
    pub fn subscribe(&self, events: Vec<EventType>) -> (SubscriberId, mpsc::Receiver<StoreEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;

        tracing::debug!("📡 Subscribed: id={}, events={:?}", id, events);
        self.subscribers.write().insert(
            id,
            Subscriber {
                events: events.into_iter().collect(),
                sender,
            },
        );

        (id, receiver)
    }

    /// 取消订阅
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            tracing::debug!("📡 Unsubscribed: id={}", id);
        }
    }

    /// 广播事件给所有订阅者（非阻塞，fire-and-forget）
    pub fn broadcast(&self, event: StoreEvent) {
        let event_type = event.event_type();
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.events.contains(&event_type) {
                    continue;
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("📡 Channel full, dropping event: id={}", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
                tracing::debug!("📡 Channel closed, removed subscriber: id={}", id);
            }
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_respects_filter() {
        let broadcaster = Broadcaster::new();

        let (_, mut rx1) = broadcaster.subscribe(vec![EventType::Sessions]);
        let (_, mut rx2) = broadcaster.subscribe(vec![EventType::Sessions, EventType::Streaming]);

        broadcaster.broadcast(StoreEvent::SessionsChanged);
        assert_eq!(rx1.try_recv().unwrap(), StoreEvent::SessionsChanged);
        assert_eq!(rx2.try_recv().unwrap(), StoreEvent::SessionsChanged);

        broadcaster.broadcast(StoreEvent::StreamingChanged { is_streaming: true });
        assert!(rx1.try_recv().is_err());
        assert_eq!(
            rx2.try_recv().unwrap(),
            StoreEvent::StreamingChanged { is_streaming: true }
        );
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let broadcaster = Broadcaster::new();

        let (_, rx) = broadcaster.subscribe(EventType::all());
        let (id2, _rx2) = broadcaster.subscribe(EventType::all());
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(rx);
        broadcaster.broadcast(StoreEvent::SessionsChanged);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.unsubscribe(id2);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
