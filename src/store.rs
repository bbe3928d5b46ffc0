//! 持久化接口
//!
//! Hub 核心只通过 [`Store`] 访问 Agent / Metric，不关心底层实现。
//! [`HubDB`] 是默认实现：每次调用放到 blocking 线程池执行，避免阻塞事件循环。

use async_trait::async_trait;

use crate::db::HubDB;
use crate::error::Result;
use crate::types::{Agent, AgentUpsert, Metric, MetricInput};

/// 持久化协作者
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// 按 uuid 幂等 upsert：不存在则创建，存在则更新可变字段
    async fn create_or_update_agent(&self, agent: &AgentUpsert) -> Result<Agent>;

    /// 写入一条 Metric（Agent 必须已存在）
    async fn create_metric(&self, agent_uuid: &str, metric: &MetricInput) -> Result<Metric>;
}

#[async_trait]
impl Store for HubDB {
    async fn create_or_update_agent(&self, agent: &AgentUpsert) -> Result<Agent> {
        let db = self.clone();
        let agent = agent.clone();
        tokio::task::spawn_blocking(move || db.upsert_agent(&agent)).await?
    }

    async fn create_metric(&self, agent_uuid: &str, metric: &MetricInput) -> Result<Metric> {
        let db = self.clone();
        let agent_uuid = agent_uuid.to_string();
        let metric = metric.clone();
        tokio::task::spawn_blocking(move || db.insert_metric(&agent_uuid, &metric)).await?
    }
}
