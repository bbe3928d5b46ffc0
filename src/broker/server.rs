//! Broker 服务器
//!
//! Unix Socket 服务：一个连接就是一个会话，处理发布/订阅请求，
//! 把会话事件和遥测消息交给 Hub 的 [`Dispatcher`]。

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::broadcaster::{valid_filter, Broadcaster};
use crate::config::HubConfig;
use crate::db::HubDB;
use crate::hub::{Dispatcher, ErrorReporter, HubContext, TransportEvent};
use crate::protocol::{Request, Response};
use crate::store::Store;

/// Broker 版本号（跟随 crate 版本）
pub const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 停机时等待在途写入完成的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 连接关闭前刷出剩余响应的上限
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker 服务
pub struct Broker {
    config: HubConfig,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Arc<Dispatcher>,
    reporter: Arc<ErrorReporter>,
    /// 已提交 SessionOpened、还没提交 SessionClosed 的会话
    ///
    /// 谁把会话从这里移除，谁负责提交 SessionClosed（连接结束或停机，只会有一次）。
    open_sessions: Mutex<HashSet<String>>,
}

impl Broker {
    /// 初始化：打开数据库、清理上次残留的在线状态，然后创建 Broker
    pub fn open(config: HubConfig) -> Result<Self> {
        let db = HubDB::connect(config.db.clone()).context("打开数据库失败")?;
        let reset = db.reset_connected()?;
        if reset > 0 {
            tracing::info!("🧹 重置 {} 个残留在线 Agent", reset);
        }
        Self::new(config, Arc::new(db))
    }

    /// 使用指定的存储创建 Broker
    pub fn new(config: HubConfig, store: Arc<dyn Store>) -> Result<Self> {
        // 确保数据目录存在
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        let broadcaster = Broadcaster::new();
        let reporter = ErrorReporter::new();
        let ctx = HubContext::new(store, broadcaster.clone()).with_reporter(reporter.clone());
        let dispatcher = Dispatcher::new(ctx);

        Ok(Self {
            config,
            broadcaster,
            dispatcher,
            reporter,
            open_sessions: Mutex::new(HashSet::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 运行 Broker，直到 Ctrl-C 或出现致命错误
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // 写入 PID 文件
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        // 创建 Unix Socket 监听器
        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 telemetry-hub broker is running: {:?}", socket_path);

        let mut fatal_rx = self.reporter.subscribe_fatal();

        // 接受连接
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let broker = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = broker.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = fatal_rx.changed() => {
                    tracing::error!("收到致命错误信号，准备退出...");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        // 存活会话按断开处理，Agent 不会停留在 connected=1
        let live: Vec<String> = self.open_sessions.lock().drain().collect();
        if !live.is_empty() {
            tracing::info!("关闭 {} 个存活会话", live.len());
        }
        for session_id in live {
            self.dispatcher
                .submit(TransportEvent::SessionClosed { session_id });
        }

        // 在途写入跑完再退出
        if tokio::time::timeout(DRAIN_TIMEOUT, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("等待在途事件超时，剩余 lane: {}", self.dispatcher.active_lanes());
        }
        self.broadcaster.close();
        self.cleanup();

        if self.reporter.is_fatal() {
            bail!("broker stopped after a fatal error");
        }
        Ok(())
    }

    /// 处理单个连接（一个会话）
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 创建消息发送通道
        let (tx, mut rx) = mpsc::channel::<String>(self.config.outbound_capacity);

        // 注册连接
        self.broadcaster.register(&session_id, tx);
        self.open_sessions.lock().insert(session_id.clone());
        self.dispatcher.submit(TransportEvent::SessionOpened {
            session_id: session_id.clone(),
        });
        tracing::debug!("📥 新连接: session_id={}", session_id);

        // 启动发送任务
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(&session_id, &mut reader).await;

        // 清理
        self.broadcaster.unregister(&session_id);
        if self.open_sessions.lock().remove(&session_id) {
            self.dispatcher.submit(TransportEvent::SessionClosed {
                session_id: session_id.clone(),
            });
        }

        // 发送通道已随 unregister 关闭，等剩余响应写完
        let abort = write_handle.abort_handle();
        if tokio::time::timeout(FLUSH_TIMEOUT, write_handle).await.is_err() {
            abort.abort();
        }
        tracing::debug!("📤 连接关闭: session_id={}", session_id);

        result
    }

    async fn read_loop(
        &self,
        session_id: &str,
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    ) -> Result<()> {
        // 多读一个字节用来判断是否超长
        let limit = self.config.max_frame_len as u64 + 1;
        let mut frame = Vec::new();
        loop {
            frame.clear();
            match (&mut *reader).take(limit).read_until(b'\n', &mut frame).await {
                // 连接关闭
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if n as u64 == limit && frame.last() != Some(&b'\n') {
                        tracing::warn!(
                            "帧超长，断开连接: session_id={}, limit={}",
                            session_id,
                            self.config.max_frame_len
                        );
                        let response = Response::Error {
                            code: 413,
                            message: format!("Frame exceeds {} bytes", self.config.max_frame_len),
                        };
                        let resp_json = serde_json::to_string(&response)?;
                        self.broadcaster
                            .send_to(session_id, format!("{}\n", resp_json))
                            .await;
                        return Ok(());
                    }

                    if frame.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    // 解析请求（非 UTF-8 也走这里）
                    let request: Request = match serde_json::from_slice(&frame) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: session_id={}, {}", session_id, e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.broadcaster
                                .try_send_to(session_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    let response = self.handle_request(session_id, request);
                    let resp_json = serde_json::to_string(&response)?;

                    // 发送响应
                    if !self
                        .broadcaster
                        .send_to(session_id, format!("{}\n", resp_json))
                        .await
                    {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: session_id={}, {}", session_id, e);
                    return Ok(());
                }
            }
        }
    }

    /// 处理请求
    fn handle_request(&self, session_id: &str, request: Request) -> Response {
        match request {
            Request::Handshake { client, version } => {
                tracing::info!(
                    "🤝 握手: session_id={}, client={}, version={}",
                    session_id,
                    client,
                    version
                );
                Response::HandshakeOk {
                    broker_version: BROKER_VERSION.to_string(),
                    session_id: session_id.to_string(),
                }
            }

            Request::Publish { topic, payload } => {
                if topic.is_empty() || topic.contains('+') || topic.contains('#') {
                    return Response::Error {
                        code: 400,
                        message: format!("Invalid topic: {:?}", topic),
                    };
                }

                // 先转发给订阅者，再交给 Hub 处理
                self.broadcaster.publish_message(&topic, &payload);
                match TransportEvent::from_publish(session_id, &topic, payload.into_bytes()) {
                    Some(event) => self.dispatcher.submit(event),
                    None => tracing::debug!("Payload on {} relayed only", topic),
                }
                Response::Ok
            }

            Request::Subscribe { topics } => {
                if let Some(bad) = topics.iter().find(|t| !valid_filter(t)) {
                    return Response::Error {
                        code: 400,
                        message: format!("Invalid topic filter: {:?}", bad),
                    };
                }
                self.broadcaster.subscribe(session_id, topics);
                Response::Ok
            }

            Request::Unsubscribe { topics } => {
                self.broadcaster.unsubscribe(session_id, topics);
                Response::Ok
            }

            Request::Heartbeat => Response::Ok,
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        // 删除 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        // 删除 PID 文件
        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Broker 清理完成");
    }
}

/// 检查 Hub 是否正在运行
pub fn is_hub_running(config: &HubConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    // 读取 PID
    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 socket / PID 文件
pub fn cleanup_stale_hub(config: &HubConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
