//! 错误上报
//!
//! 所有管线错误都经过 [`ErrorReporter`]：分类、带上下文写日志、计数。
//! 只有 [`Severity::Fatal`] 会触发停机信号，其他错误都在本地恢复。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::error::{ErrorKind, HubError, Severity};

/// 错误上下文（尽量带上 session_id / agent_uuid，方便排查）
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub session_id: Option<String>,
    pub agent_uuid: Option<String>,
}

impl ErrorContext {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            agent_uuid: None,
        }
    }

    pub fn with_agent(mut self, agent_uuid: &str) -> Self {
        self.agent_uuid = Some(agent_uuid.to_string());
        self
    }
}

/// 错误上报器
pub struct ErrorReporter {
    counts: Mutex<HashMap<ErrorKind, u64>>,
    fatal_tx: watch::Sender<bool>,
}

impl ErrorReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 上报错误，返回严重程度
    pub fn report(&self, err: &HubError, ctx: &ErrorContext) -> Severity {
        let kind = err.kind();
        *self.counts.lock().entry(kind).or_insert(0) += 1;

        let session_id = ctx.session_id.as_deref().unwrap_or("-");
        let agent_uuid = ctx.agent_uuid.as_deref().unwrap_or("-");

        match kind {
            ErrorKind::Parse => {
                tracing::warn!(session_id, kind = kind.as_str(), "🗑️ 丢弃消息: {}", err);
            }
            ErrorKind::DuplicateSession | ErrorKind::UnknownSession | ErrorKind::AgentMismatch => {
                tracing::warn!(session_id, agent_uuid, kind = kind.as_str(), "⚠️ {}", err);
            }
            ErrorKind::Store | ErrorKind::Publish => {
                tracing::error!(session_id, agent_uuid, kind = kind.as_str(), "{}", err);
            }
            ErrorKind::Fatal => {
                tracing::error!(session_id, agent_uuid, "💥 [fatal error] {}", err);
                self.fatal_tx.send_replace(true);
            }
        }

        kind.severity()
    }

    /// 某类错误累计次数
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.counts.lock().get(&kind).copied().unwrap_or(0)
    }

    /// 所有错误累计次数
    pub fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    /// 是否已经出现致命错误
    pub fn is_fatal(&self) -> bool {
        *self.fatal_tx.borrow()
    }

    /// 订阅致命错误信号（值变为 true 时应停机）
    pub fn subscribe_fatal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        let (fatal_tx, _) = watch::channel(false);
        Self {
            counts: Mutex::new(HashMap::new()),
            fatal_tx,
        }
    }
}
