//! 生命周期通知
//!
//! 把 agent/connected、agent/disconnected 按固定 schema 序列化后交给传输层发布。
//! 通知是尽力而为的信号（真正的状态以 agents 表为准），失败只上报，不重试。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{topic, AgentRef, ConnectedAgent, ConnectedNotice, DisconnectedNotice};
use crate::types::Agent;

/// 发布失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("transport closed")]
    Closed,

    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// 传输层的发布能力
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Connected(ConnectedAgent),
    Disconnected(AgentRef),
}

impl Lifecycle {
    pub fn topic(&self) -> &'static str {
        match self {
            Lifecycle::Connected(_) => topic::AGENT_CONNECTED,
            Lifecycle::Disconnected(_) => topic::AGENT_DISCONNECTED,
        }
    }

    /// 序列化为线上格式
    pub fn encode(&self) -> Result<Vec<u8>, PublishError> {
        let result = match self {
            Lifecycle::Connected(agent) => serde_json::to_vec(&ConnectedNotice {
                agent: agent.clone(),
            }),
            Lifecycle::Disconnected(agent) => serde_json::to_vec(&DisconnectedNotice {
                agent: agent.clone(),
            }),
        };
        result.map_err(|e| PublishError::Serialize(e.to_string()))
    }
}

/// 生命周期通知器
#[derive(Clone)]
pub struct LifecycleNotifier {
    publisher: Arc<dyn Publisher>,
}

impl LifecycleNotifier {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// 发布 agent/connected
    pub async fn connected(&self, agent: &Agent) -> Result<(), PublishError> {
        self.publish(Lifecycle::Connected(ConnectedAgent {
            uuid: agent.uuid.clone(),
            name: agent.name.clone(),
            hostname: agent.hostname.clone(),
            pid: agent.pid,
            connected: true,
        }))
        .await
    }

    /// 发布 agent/disconnected
    pub async fn disconnected(&self, agent_uuid: &str) -> Result<(), PublishError> {
        self.publish(Lifecycle::Disconnected(AgentRef {
            uuid: agent_uuid.to_string(),
        }))
        .await
    }

    pub async fn publish(&self, event: Lifecycle) -> Result<(), PublishError> {
        let payload = event.encode()?;
        self.publisher.publish(event.topic(), payload).await?;
        tracing::debug!("📣 {} published", event.topic());
        Ok(())
    }
}
