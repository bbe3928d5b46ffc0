//! 协议定义
//!
//! - Broker 帧：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//! - Topic 常量和生命周期通知的固定 schema

use serde::{Deserialize, Serialize};

/// 已知 Topic 常量
pub mod topic {
    /// Agent 上报（agent + metrics）
    pub const AGENT_MESSAGE: &str = "agent/message";
    /// Agent 上线通知（只发不收）
    pub const AGENT_CONNECTED: &str = "agent/connected";
    /// Agent 下线通知（只发不收）
    pub const AGENT_DISCONNECTED: &str = "agent/disconnected";
}

/// Topic 分类（在传输边界解析一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// 应用数据，按 agent/message 处理
    Telemetry,
    /// Hub 自己发出的生命周期通知，不回灌到处理管线
    Lifecycle,
}

impl TopicKind {
    pub fn classify(topic: &str) -> Self {
        match topic {
            topic::AGENT_CONNECTED | topic::AGENT_DISCONNECTED => TopicKind::Lifecycle,
            _ => TopicKind::Telemetry,
        }
    }
}

/// 请求类型（Client → Broker）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 客户端名称（agent / dashboard / ...）
        client: String,
        /// 客户端版本（用于日志和诊断）
        version: String,
    },

    /// 发布消息
    Publish {
        topic: String,
        /// 原始 payload 文本（不做解析，由订阅方/Hub 自行校验）
        payload: String,
    },

    /// 订阅 Topic（支持 `+` 单层通配和末尾 `#`）
    Subscribe { topics: Vec<String> },

    /// 取消订阅
    Unsubscribe { topics: Vec<String> },

    /// 心跳（保持连接）
    Heartbeat,
}

/// 响应类型（Broker → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Broker 版本
        broker_version: String,
        /// 本连接的会话 ID
        session_id: String,
    },
}

/// 推送消息（Broker → 订阅者）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    Message { topic: String, payload: String },
}

/// agent/connected 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedNotice {
    pub agent: ConnectedAgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedAgent {
    pub uuid: String,
    pub name: String,
    pub hostname: String,
    pub pid: i64,
    pub connected: bool,
}

/// agent/disconnected 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedNotice {
    pub agent: AgentRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub uuid: String,
}
