//! Hub 核心 - 会话对账 + 遥测写入 + 生命周期通知
//!
//! 数据流：
//! - 传输事件 → [`Dispatcher`]（按会话串行）
//! - 消息 → [`codec::parse`] → [`AgentReconciler::reconcile`] → [`MetricIngestor::ingest`]
//! - 会话关闭 → [`SessionRegistry::close`] → [`AgentReconciler::mark_disconnected`]
//!
//! Hub 只通过 [`Store`] 和 [`Publisher`] 两个 trait 访问存储和传输层，
//! 两者在初始化阶段装进 [`HubContext`]，之后才能创建 [`Dispatcher`]。

pub mod codec;
mod dispatcher;
mod error;
mod ingestor;
mod notifier;
mod reconciler;
mod registry;
mod reporter;

use std::sync::Arc;

use crate::protocol::TopicKind;
use crate::store::Store;

pub use codec::{ParseFailure, ParsedAgent, ParsedMessage};
pub use dispatcher::{Dispatcher, Outcome};
pub use error::{ErrorKind, HubError, Severity};
pub use ingestor::{IngestReport, MetricIngestor};
pub use notifier::{Lifecycle, LifecycleNotifier, PublishError, Publisher};
pub use reconciler::{AgentReconciler, Disconnect};
pub use registry::{Association, RegistryError, SessionEntry, SessionRegistry, SessionState};
pub use reporter::{ErrorContext, ErrorReporter};

/// 传输层分配的会话 ID（不透明）
pub type SessionId = String;

/// 传输事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SessionOpened {
        session_id: SessionId,
    },
    SessionClosed {
        session_id: SessionId,
    },
    MessageReceived {
        session_id: SessionId,
        /// 仅用于日志，分类已经在 [`TransportEvent::from_publish`] 完成
        topic: String,
        payload: Vec<u8>,
    },
}

impl TransportEvent {
    /// 把一次发布转换成事件；生命周期 topic 只发不收，返回 None
    pub fn from_publish(session_id: &str, topic: &str, payload: Vec<u8>) -> Option<Self> {
        match TopicKind::classify(topic) {
            TopicKind::Telemetry => Some(TransportEvent::MessageReceived {
                session_id: session_id.to_string(),
                topic: topic.to_string(),
                payload,
            }),
            TopicKind::Lifecycle => None,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            TransportEvent::SessionOpened { session_id }
            | TransportEvent::SessionClosed { session_id }
            | TransportEvent::MessageReceived { session_id, .. } => session_id,
        }
    }
}

/// 初始化阶段的产物：持有存储和发布能力
#[derive(Clone)]
pub struct HubContext {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub reporter: Arc<ErrorReporter>,
}

impl HubContext {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            reporter: ErrorReporter::new(),
        }
    }

    /// 使用外部的错误上报器（Broker 需要监听致命信号）
    pub fn with_reporter(mut self, reporter: Arc<ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}
