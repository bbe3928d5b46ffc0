//! Agent 对账
//!
//! 把会话和持久化的 Agent 对上，并决定什么时候发生命周期通知。
//!
//! 同一个 agent uuid 的写入（可能来自不同会话，比如断线重连）由一把按 uuid
//! 分配的异步锁串行化。「是否已通知上线」按 uuid 记录，而不是按会话：
//! - 新关联且该 uuid 未处于已通知状态 → 发 agent/connected
//! - 会话关闭时该 uuid 没有其他存活会话 → 写 connected=false 并发 agent/disconnected
//! - 还有其他会话持有该 uuid → 什么都不写，避免把新会话的在线状态覆盖掉

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::codec::ParsedAgent;
use super::error::HubError;
use super::notifier::LifecycleNotifier;
use super::registry::{Association, SessionEntry, SessionRegistry, SessionState};
use super::reporter::{ErrorContext, ErrorReporter};
use crate::store::Store;
use crate::types::{Agent, AgentUpsert};

/// 断开处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// 会话从未关联：不写库、不通知
    NotAssociated,
    /// 该 Agent 还有其他存活会话：保持在线
    StillConnected { agent_uuid: String },
    /// 已写 connected=false
    Persisted { agent_uuid: String, notified: bool },
}

/// 按 key 分配的异步锁，空闲时自动回收
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self.locks.lock().entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock();
        // 只剩 map 自己持有时回收
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Agent 对账器
pub struct AgentReconciler {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    notifier: LifecycleNotifier,
    reporter: Arc<ErrorReporter>,
    agent_locks: KeyedLocks,
    /// 已发出 agent/connected、尚未发出 agent/disconnected 的 uuid
    ///
    /// 只在持有对应 uuid 的锁时修改。
    announced: Mutex<HashSet<String>>,
}

impl AgentReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        notifier: LifecycleNotifier,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            reporter,
            agent_locks: KeyedLocks::default(),
            announced: Mutex::new(HashSet::new()),
        }
    }

    /// 对账：upsert(connected=true) → 关联会话 → 必要时发 agent/connected
    ///
    /// 存储失败时直接返回，会话保持原来的状态，也不会发通知。
    pub async fn reconcile(&self, session_id: &str, parsed: &ParsedAgent) -> Result<Agent, HubError> {
        let entry = self
            .registry
            .lookup(session_id)
            .ok_or_else(|| HubError::UnknownSession(session_id.to_string()))?;
        if let SessionState::Associated(bound) = &entry.state {
            if bound.uuid != parsed.uuid {
                return Err(HubError::AgentMismatch {
                    session_id: session_id.to_string(),
                    bound: bound.uuid.clone(),
                    received: parsed.uuid.clone(),
                });
            }
        }

        let _guard = self.agent_locks.lock(&parsed.uuid).await;

        let agent = self
            .store
            .create_or_update_agent(&parsed.to_upsert(true))
            .await?;
        if agent.uuid != parsed.uuid {
            return Err(HubError::Fatal(format!(
                "store returned agent {} for upsert of {}",
                agent.uuid, parsed.uuid
            )));
        }
        tracing::debug!("💾 Agent saved: session_id={}, uuid={}", session_id, agent.uuid);

        let association = self.registry.associate(session_id, agent.clone())?;
        if association == Association::New {
            let first = self.announced.lock().insert(agent.uuid.clone());
            if first {
                if let Err(e) = self.notifier.connected(&agent).await {
                    self.reporter.report(
                        &e.into(),
                        &ErrorContext::session(session_id).with_agent(&agent.uuid),
                    );
                }
                tracing::info!("🟢 Agent connected: uuid={}, session_id={}", agent.uuid, session_id);
            } else {
                tracing::debug!(
                    "Agent {} already online, session {} joined",
                    agent.uuid,
                    session_id
                );
            }
        }

        Ok(agent)
    }

    /// 会话关闭后的断开处理
    ///
    /// `entry` 必须是 `SessionRegistry::close` 返回的终态快照。
    pub async fn mark_disconnected(&self, entry: SessionEntry) -> Result<Disconnect, HubError> {
        let agent = match entry.state {
            SessionState::Associated(agent) => agent,
            SessionState::Unassociated => return Ok(Disconnect::NotAssociated),
        };

        let _guard = self.agent_locks.lock(&agent.uuid).await;

        if self.registry.live_sessions(&agent.uuid) > 0 {
            tracing::debug!(
                "Agent {} still has live sessions, skip disconnect of {}",
                agent.uuid,
                entry.session_id
            );
            return Ok(Disconnect::StillConnected {
                agent_uuid: agent.uuid,
            });
        }

        self.store
            .create_or_update_agent(&AgentUpsert::from_agent(&agent, false))
            .await?;

        let notified = self.announced.lock().remove(&agent.uuid);
        if notified {
            if let Err(e) = self.notifier.disconnected(&agent.uuid).await {
                self.reporter.report(
                    &e.into(),
                    &ErrorContext::session(&entry.session_id).with_agent(&agent.uuid),
                );
            }
        }

        tracing::info!(
            "🔴 Session({}) associated to Agent({}) marked as disconnected",
            entry.session_id,
            agent.uuid
        );

        Ok(Disconnect::Persisted {
            agent_uuid: agent.uuid,
            notified,
        })
    }
}
