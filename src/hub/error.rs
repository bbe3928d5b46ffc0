//! 处理管线错误

use thiserror::Error;

use super::codec::ParseFailure;
use super::notifier::PublishError;
use super::SessionId;

/// 管线错误（每种都对应一个 [`ErrorKind`]）
#[derive(Error, Debug)]
pub enum HubError {
    /// payload 不合法，消息被丢弃
    #[error("解析失败: {0}")]
    Parse(#[from] ParseFailure),

    /// 持久化失败
    #[error("存储失败: {0}")]
    Store(#[from] crate::Error),

    /// 生命周期通知发送失败（不重试）
    #[error("发布失败: {0}")]
    Publish(#[from] PublishError),

    /// 传输层对同一个会话重复 open
    #[error("重复的会话: {0}")]
    DuplicateSession(SessionId),

    /// 会话不存在（open 之前或 close 之后收到事件）
    #[error("未知会话: {0}")]
    UnknownSession(SessionId),

    /// 同一个会话上报了不同的 agent uuid
    #[error("会话 {session_id} 已关联 agent {bound}，拒绝 {received}")]
    AgentMismatch {
        session_id: SessionId,
        bound: String,
        received: String,
    },

    /// 不可恢复（内部不变量被破坏 / 传输层启动失败）
    #[error("致命错误: {0}")]
    Fatal(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Store,
    Publish,
    DuplicateSession,
    UnknownSession,
    AgentMismatch,
    Fatal,
}

/// 严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// 本地恢复，服务继续
    Recoverable,
    /// 终止服务
    Fatal,
}

impl ErrorKind {
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Fatal => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Store => "store",
            ErrorKind::Publish => "publish",
            ErrorKind::DuplicateSession => "duplicate_session",
            ErrorKind::UnknownSession => "unknown_session",
            ErrorKind::AgentMismatch => "agent_mismatch",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Parse(_) => ErrorKind::Parse,
            HubError::Store(_) => ErrorKind::Store,
            HubError::Publish(_) => ErrorKind::Publish,
            HubError::DuplicateSession(_) => ErrorKind::DuplicateSession,
            HubError::UnknownSession(_) => ErrorKind::UnknownSession,
            HubError::AgentMismatch { .. } => ErrorKind::AgentMismatch,
            HubError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}
