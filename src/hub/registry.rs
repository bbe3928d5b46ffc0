//! 会话注册表
//!
//! 传输层会话 ID → 会话状态（未关联 / 已关联某个 Agent）。
//! 同时维护 presence 索引：agent uuid → 当前关联它的存活会话。
//!
//! 所有读写都在一把 `RwLock` 里完成，锁不会跨 await 持有。
//! `close` 在同一个写锁区间里删除条目并返回最后状态，
//! 所以每个会话的终态快照只会被观察到一次。

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use thiserror::Error;

use super::error::HubError;
use super::SessionId;
use crate::db::current_time_ms;
use crate::types::Agent;

/// 会话状态
///
/// Agent 快照放在 `Associated` 里，保证「有 agent 引用 ⇔ 已关联」。
/// 关闭后的会话不再留在注册表中，`close` 返回的就是它的终态快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// 已连接，还没有发送过合法的上报
    Unassociated,
    /// 已关联到持久化的 Agent
    Associated(Agent),
}

/// 会话条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub state: SessionState,
    /// open 时间（毫秒）
    pub opened_at: i64,
}

impl SessionEntry {
    pub fn agent(&self) -> Option<&Agent> {
        match &self.state {
            SessionState::Associated(agent) => Some(agent),
            SessionState::Unassociated => None,
        }
    }

    pub fn is_associated(&self) -> bool {
        matches!(self.state, SessionState::Associated(_))
    }
}

/// 关联结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// Unassociated → Associated
    New,
    /// 已经关联到同一个 Agent，只刷新了快照
    Existing,
}

/// 注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} already open")]
    DuplicateSession(SessionId),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {session_id} bound to agent {bound}, got {received}")]
    AgentMismatch {
        session_id: SessionId,
        bound: String,
        received: String,
    },
}

impl From<RegistryError> for HubError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateSession(id) => HubError::DuplicateSession(id),
            RegistryError::NotFound(id) => HubError::UnknownSession(id),
            RegistryError::AgentMismatch {
                session_id,
                bound,
                received,
            } => HubError::AgentMismatch {
                session_id,
                bound,
                received,
            },
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    /// agent uuid → 关联它的存活会话
    presence: HashMap<String, HashSet<SessionId>>,
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新会话（Unassociated）
    ///
    /// 重复 open 时保留已有条目并返回 `DuplicateSession`。
    pub fn open(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(session_id) {
            return Err(RegistryError::DuplicateSession(session_id.to_string()));
        }

        inner.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                state: SessionState::Unassociated,
                opened_at: current_time_ms(),
            },
        );
        Ok(())
    }

    /// 关联 Agent
    ///
    /// 同一个 uuid 重复关联是幂等的（只刷新快照，断开时回写的是最新字段）。
    pub fn associate(&self, session_id: &str, agent: Agent) -> Result<Association, RegistryError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let entry = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        match entry.agent().map(|bound| bound.uuid.clone()) {
            Some(bound) if bound != agent.uuid => Err(RegistryError::AgentMismatch {
                session_id: session_id.to_string(),
                bound,
                received: agent.uuid,
            }),
            Some(_) => {
                entry.state = SessionState::Associated(agent);
                Ok(Association::Existing)
            }
            None => {
                inner
                    .presence
                    .entry(agent.uuid.clone())
                    .or_default()
                    .insert(session_id.to_string());
                entry.state = SessionState::Associated(agent);
                Ok(Association::New)
            }
        }
    }

    /// 查询会话
    pub fn lookup(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    /// 关闭会话：删除条目并返回终态快照
    pub fn close(&self, session_id: &str) -> Option<SessionEntry> {
        let mut inner = self.inner.write();
        let entry = inner.sessions.remove(session_id)?;

        if let SessionState::Associated(agent) = &entry.state {
            if let Some(sessions) = inner.presence.get_mut(&agent.uuid) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    inner.presence.remove(&agent.uuid);
                }
            }
        }

        Some(entry)
    }

    /// 关联到该 Agent 的存活会话数
    pub fn live_sessions(&self, agent_uuid: &str) -> usize {
        self.inner
            .read()
            .presence
            .get(agent_uuid)
            .map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}
