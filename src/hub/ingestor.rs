//! Metric 写入
//!
//! 按上报顺序逐条写入（不并发），保证同一个 Agent 的行顺序和上报顺序一致。
//! 单条失败只上报，批次里剩下的继续写：metric 之间没有跨行约束。

use std::sync::Arc;

use super::reporter::{ErrorContext, ErrorReporter};
use crate::store::Store;
use crate::types::MetricInput;

/// 批次写入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub stored: usize,
    pub failed: usize,
}

/// Metric 写入器
pub struct MetricIngestor {
    store: Arc<dyn Store>,
    reporter: Arc<ErrorReporter>,
}

impl MetricIngestor {
    pub fn new(store: Arc<dyn Store>, reporter: Arc<ErrorReporter>) -> Self {
        Self { store, reporter }
    }

    pub async fn ingest(
        &self,
        session_id: &str,
        agent_uuid: &str,
        metrics: &[MetricInput],
    ) -> IngestReport {
        let mut report = IngestReport::default();

        for (index, metric) in metrics.iter().enumerate() {
            match self.store.create_metric(agent_uuid, metric).await {
                Ok(saved) => {
                    report.stored += 1;
                    tracing::trace!("Metric: {} saved on agent {}", saved.id, agent_uuid);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!(
                        index,
                        "metric #{} ({}) failed on agent {}",
                        index,
                        metric.metric_type,
                        agent_uuid
                    );
                    self.reporter.report(
                        &e.into(),
                        &ErrorContext::session(session_id).with_agent(agent_uuid),
                    );
                }
            }
        }

        if !metrics.is_empty() {
            tracing::debug!(
                "📊 Metrics ingested: agent={}, stored={}, failed={}",
                agent_uuid,
                report.stored,
                report.failed
            );
        }

        report
    }
}
