//! 消息广播器
//!
//! 维护每个会话的 topic 订阅，把发布的消息推送给匹配的订阅者。
//! 同时实现 [`Publisher`]，Hub 的生命周期通知也从这里发出。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::hub::{PublishError, Publisher, SessionId};
use crate::protocol::Push;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 消息广播器
pub struct Broadcaster {
    /// 订阅关系：SessionId → topic filter
    subscriptions: RwLock<HashMap<SessionId, HashSet<String>>>,
    /// 连接通道：SessionId → 发送通道
    senders: RwLock<HashMap<SessionId, MessageSender>>,
    /// 停机后拒绝发布
    closed: AtomicBool,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册连接
    pub fn register(&self, session_id: &str, sender: MessageSender) {
        self.senders.write().insert(session_id.to_string(), sender);
        self.subscriptions
            .write()
            .insert(session_id.to_string(), HashSet::new());
        tracing::debug!("📡 Connection registered: session_id={}", session_id);
    }

    /// 注销连接
    pub fn unregister(&self, session_id: &str) {
        self.senders.write().remove(session_id);
        self.subscriptions.write().remove(session_id);
        tracing::debug!("📡 Connection unregistered: session_id={}", session_id);
    }

    /// 订阅 topic
    pub fn subscribe(&self, session_id: &str, filters: Vec<String>) {
        if let Some(sub) = self.subscriptions.write().get_mut(session_id) {
            tracing::debug!("📡 Subscribed: session_id={}, filters={:?}", session_id, filters);
            sub.extend(filters);
        }
    }

    /// 取消订阅
    pub fn unsubscribe(&self, session_id: &str, filters: Vec<String>) {
        if let Some(sub) = self.subscriptions.write().get_mut(session_id) {
            for filter in &filters {
                sub.remove(filter);
            }
            tracing::debug!("📡 Unsubscribed: session_id={}, filters={:?}", session_id, filters);
        }
    }

    /// 推送消息给所有匹配的订阅者（非阻塞，fire-and-forget），返回投递数
    pub fn publish_message(&self, topic: &str, payload: &str) -> usize {
        let push = Push::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };

        // 序列化消息（JSONL 格式）
        let message = match serde_json::to_string(&push) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("Failed to serialize push: {}", e);
                return 0;
            }
        };

        // 获取需要推送的连接
        let targets: Vec<(SessionId, MessageSender)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, filters)| filters.iter().any(|f| topic_matches(f, topic)))
                .filter_map(|(session_id, _)| {
                    senders.get(session_id).map(|s| (session_id.clone(), s.clone()))
                })
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: topic={}", topic);
            return 0;
        }

        tracing::debug!("📡 Publishing: topic={}, subscribers={}", topic, targets.len());

        let mut delivered = 0;
        for (session_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping message: session_id={}", session_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed: session_id={}", session_id);
                }
            }
        }
        delivered
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 检查是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.senders.read().is_empty()
    }

    /// 发送消息到指定连接
    pub async fn send_to(&self, session_id: &str, message: String) -> bool {
        // 先获取 sender 的 clone，然后释放锁
        let sender = self.senders.read().get(session_id).cloned();

        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }

    /// 尝试发送消息到指定连接（非阻塞）
    pub fn try_send_to(&self, session_id: &str, message: String) -> bool {
        let sender = self.senders.read().get(session_id).cloned();

        match sender {
            Some(sender) => sender.try_send(message).is_ok(),
            None => false,
        }
    }

    /// 停止对外发布
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Publisher for Broadcaster {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PublishError::Closed);
        }
        let payload =
            String::from_utf8(payload).map_err(|e| PublishError::Serialize(e.to_string()))?;
        self.publish_message(topic, &payload);
        Ok(())
    }
}

/// MQTT 风格的 topic 匹配：`+` 匹配一层，末尾 `#` 匹配剩余所有层
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// filter 是否合法（`#` 只能出现在最后一层，通配符必须独占一层）
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("agent/message", "agent/message"));
        assert!(topic_matches("agent/+", "agent/connected"));
        assert!(topic_matches("agent/#", "agent/connected"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("+/message", "agent/message"));

        assert!(!topic_matches("agent/+", "agent/a/b"));
        assert!(!topic_matches("agent/message", "agent/connected"));
        assert!(!topic_matches("agent/message/x", "agent/message"));
    }

    #[test]
    fn test_valid_filter() {
        assert!(valid_filter("agent/#"));
        assert!(valid_filter("+/message"));
        assert!(!valid_filter(""));
        assert!(!valid_filter("agent/#/x"));
        assert!(!valid_filter("agent/me+"));
    }

    #[test]
    fn test_broadcaster_subscribe_and_publish() {
        let broadcaster = Broadcaster::new();

        // 创建两个订阅者
        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);

        broadcaster.register("s-1", tx1);
        broadcaster.register("s-2", tx2);

        // s-1 只订阅 agent/connected，s-2 订阅 agent/#
        broadcaster.subscribe("s-1", vec!["agent/connected".to_string()]);
        broadcaster.subscribe("s-2", vec!["agent/#".to_string()]);

        assert_eq!(broadcaster.publish_message("agent/connected", "{}"), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        // 只有 s-2 应该收到
        assert_eq!(broadcaster.publish_message("agent/disconnected", "{}"), 1);
        assert!(rx1.try_recv().is_err());
        let line = rx2.try_recv().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("agent/disconnected"));

        broadcaster.unsubscribe("s-2", vec!["agent/#".to_string()]);
        assert_eq!(broadcaster.publish_message("agent/disconnected", "{}"), 0);
    }

    #[test]
    fn test_connection_count() {
        let broadcaster = Broadcaster::new();

        assert_eq!(broadcaster.connection_count(), 0);

        let (tx1, _rx1) = mpsc::channel(10);
        broadcaster.register("s-1", tx1);
        assert_eq!(broadcaster.connection_count(), 1);

        let (tx2, _rx2) = mpsc::channel(10);
        broadcaster.register("s-2", tx2);
        assert_eq!(broadcaster.connection_count(), 2);

        broadcaster.unregister("s-1");
        assert_eq!(broadcaster.connection_count(), 1);
        assert!(broadcaster.has_connections());
    }

    #[tokio::test]
    async fn test_publisher_rejects_after_close() {
        let broadcaster = Broadcaster::new();
        assert!(broadcaster.publish("agent/connected", b"{}".to_vec()).await.is_ok());

        broadcaster.close();
        assert_eq!(
            broadcaster.publish("agent/connected", b"{}".to_vec()).await,
            Err(PublishError::Closed)
        );
    }
}
