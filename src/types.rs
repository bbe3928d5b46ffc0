//! 数据类型定义

use serde::{Deserialize, Serialize};

/// Agent（持久化实体，由 Store 拥有）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub uuid: String,
    pub name: String,
    pub username: String,
    pub hostname: String,
    pub pid: i64,
    pub connected: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Agent 写入参数（按 uuid upsert）
///
/// `None` 的字段在更新时保留库中已有的值，新建时使用默认值。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpsert {
    pub uuid: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i64>,
    pub connected: bool,
}

impl AgentUpsert {
    /// 从已持久化的 Agent 快照构造（断开时回写用）
    pub fn from_agent(agent: &Agent, connected: bool) -> Self {
        Self {
            uuid: agent.uuid.clone(),
            name: Some(agent.name.clone()),
            username: Some(agent.username.clone()),
            hostname: Some(agent.hostname.clone()),
            pid: Some(agent.pid),
            connected,
        }
    }
}

/// Metric（只追加）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub agent_uuid: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: String,
    pub timestamp: i64,
    pub created_at: i64,
}

/// Metric 写入参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricInput {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: String,
    /// 采集时间（毫秒），None 时使用写入时间
    pub timestamp: Option<i64>,
}

/// 库统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub agent_count: i64,
    pub connected_count: i64,
    pub metric_count: i64,
}
