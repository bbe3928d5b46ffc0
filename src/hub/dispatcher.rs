//! 事件分发
//!
//! 每个会话一条 lane（按需创建的任务 + 无界队列），同一会话的事件严格按到达顺序
//! 串行处理；不同会话之间完全并行。lane 只有在持有 lanes 锁、且队列为空时才退出，
//! 所以同一会话后续的事件一定进入一条新的 lane，并且在旧 lane 处理完之后才开始。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::codec;
use super::error::{ErrorKind, HubError};
use super::ingestor::{IngestReport, MetricIngestor};
use super::notifier::LifecycleNotifier;
use super::reconciler::{AgentReconciler, Disconnect};
use super::registry::SessionRegistry;
use super::reporter::{ErrorContext, ErrorReporter};
use super::{HubContext, SessionId, TransportEvent};

/// 单个事件的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 会话已登记
    Opened,
    /// 上报已对账并写入 metrics
    Ingested {
        agent_uuid: String,
        report: IngestReport,
    },
    /// 会话已关闭
    Closed(Disconnect),
    /// 事件被丢弃（错误已上报）
    Dropped(ErrorKind),
}

/// 事件分发器
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    reconciler: AgentReconciler,
    ingestor: MetricIngestor,
    reporter: Arc<ErrorReporter>,
    lanes: Mutex<HashMap<SessionId, mpsc::UnboundedSender<TransportEvent>>>,
    idle: Notify,
}

impl Dispatcher {
    /// 用初始化阶段产出的上下文创建分发器
    pub fn new(ctx: HubContext) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let notifier = LifecycleNotifier::new(ctx.publisher);
        let reconciler = AgentReconciler::new(
            ctx.store.clone(),
            registry.clone(),
            notifier,
            ctx.reporter.clone(),
        );
        let ingestor = MetricIngestor::new(ctx.store, ctx.reporter.clone());

        Arc::new(Self {
            registry,
            reconciler,
            ingestor,
            reporter: ctx.reporter,
            lanes: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    /// 投递事件到对应会话的 lane（非阻塞）
    pub fn submit(self: &Arc<Self>, event: TransportEvent) {
        let session_id = event.session_id().to_string();
        let mut lanes = self.lanes.lock();

        let event = match lanes.get(&session_id) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // lane 任务异常退出，重建
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        lanes.insert(session_id.clone(), tx);
        drop(lanes);

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_lane(session_id, event, rx).await;
        });
    }

    async fn run_lane(
        self: Arc<Self>,
        session_id: SessionId,
        first: TransportEvent,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let _guard = LaneGuard {
            dispatcher: &self,
            session_id: &session_id,
        };

        let mut next = first;
        loop {
            self.handle(next).await;

            let mut lanes = self.lanes.lock();
            match rx.try_recv() {
                Ok(event) => {
                    drop(lanes);
                    next = event;
                }
                Err(_) => {
                    lanes.remove(&session_id);
                    break;
                }
            }
        }
    }

    /// 等待所有 lane 处理完
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.lanes.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// 当前活跃的 lane 数
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// 直接处理一个事件（lane 内部调用；调用方自己保证同一会话串行）
    pub async fn handle(&self, event: TransportEvent) -> Outcome {
        match event {
            TransportEvent::SessionOpened { session_id } => self.on_open(&session_id),
            TransportEvent::MessageReceived {
                session_id,
                topic,
                payload,
            } => self.on_message(&session_id, &topic, &payload).await,
            TransportEvent::SessionClosed { session_id } => self.on_close(&session_id).await,
        }
    }

    fn on_open(&self, session_id: &str) -> Outcome {
        tracing::debug!("📥 Session opened: session_id={}", session_id);
        match self.registry.open(session_id) {
            Ok(()) => Outcome::Opened,
            Err(e) => self.drop_with(e.into(), ErrorContext::session(session_id)),
        }
    }

    async fn on_message(&self, session_id: &str, topic: &str, payload: &[u8]) -> Outcome {
        tracing::debug!(
            "📨 Received: session_id={}, topic={}, bytes={}",
            session_id,
            topic,
            payload.len()
        );

        let parsed = match codec::parse(payload) {
            Ok(parsed) => parsed,
            Err(failure) => {
                return self.drop_with(failure.into(), ErrorContext::session(session_id));
            }
        };

        let agent = match self.reconciler.reconcile(session_id, &parsed.agent).await {
            Ok(agent) => agent,
            Err(e) => {
                return self.drop_with(
                    e,
                    ErrorContext::session(session_id).with_agent(&parsed.agent.uuid),
                );
            }
        };

        let report = self
            .ingestor
            .ingest(session_id, &agent.uuid, &parsed.metrics)
            .await;

        Outcome::Ingested {
            agent_uuid: agent.uuid,
            report,
        }
    }

    async fn on_close(&self, session_id: &str) -> Outcome {
        tracing::debug!("📤 Session closed: session_id={}", session_id);

        let entry = match self.registry.close(session_id) {
            Some(entry) => entry,
            None => {
                return self.drop_with(
                    HubError::UnknownSession(session_id.to_string()),
                    ErrorContext::session(session_id),
                );
            }
        };

        let agent_uuid = entry.agent().map(|a| a.uuid.clone());
        match self.reconciler.mark_disconnected(entry).await {
            Ok(disconnect) => Outcome::Closed(disconnect),
            Err(e) => {
                let mut ctx = ErrorContext::session(session_id);
                ctx.agent_uuid = agent_uuid;
                self.drop_with(e, ctx)
            }
        }
    }

    fn drop_with(&self, err: HubError, ctx: ErrorContext) -> Outcome {
        let kind = err.kind();
        self.reporter.report(&err, &ctx);
        Outcome::Dropped(kind)
    }
}

/// lane 任务 panic 时清理 lane 并按致命错误上报
struct LaneGuard<'a> {
    dispatcher: &'a Dispatcher,
    session_id: &'a str,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.dispatcher.lanes.lock().remove(self.session_id);
            self.dispatcher.reporter.report(
                &HubError::Fatal("session lane panicked".into()),
                &ErrorContext::session(self.session_id),
            );
        }
        if self.dispatcher.lanes.lock().is_empty() {
            self.dispatcher.idle.notify_waiters();
        }
    }
}
