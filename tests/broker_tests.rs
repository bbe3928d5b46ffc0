//! Broker 端到端测试（Unix Socket）

#[cfg(feature = "broker")]
mod broker_e2e {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use telemetry_hub::hub::{ErrorContext, HubError};
    use telemetry_hub::{Broker, DbConfig, HubConfig, HubDB};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(config: &HubConfig) -> Self {
            let stream = UnixStream::connect(config.socket_path()).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send_bytes(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn send(&mut self, frame: Value) {
            self.send_raw(&frame.to_string()).await;
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        /// 读到指定 topic 的推送为止，返回解析后的 payload
        async fn wait_push(&mut self, topic: &str) -> Value {
            loop {
                let frame = self.next().await;
                if frame["type"] == "Message" && frame["topic"] == topic {
                    let payload = frame["payload"].as_str().unwrap();
                    return serde_json::from_str(payload).unwrap();
                }
            }
        }
    }

    struct Running {
        broker: Arc<Broker>,
        config: HubConfig,
        db: HubDB,
        handle: JoinHandle<anyhow::Result<()>>,
        _tmp: TempDir,
    }

    /// 启动 Broker，等待 socket 就绪
    async fn start() -> (Arc<Broker>, HubConfig, HubDB, TempDir) {
        let running = start_with(|_| {}).await;
        (running.broker, running.config, running.db, running._tmp)
    }

    async fn start_with(tweak: impl FnOnce(&mut HubConfig)) -> Running {
        let tmp = TempDir::new().unwrap();
        let mut config = HubConfig::with_data_dir(tmp.path());
        tweak(&mut config);
        let db = HubDB::connect(DbConfig::memory()).unwrap();

        let broker = Arc::new(Broker::new(config.clone(), Arc::new(db.clone())).unwrap());
        let handle = tokio::spawn(broker.clone().run());

        for _ in 0..50 {
            if config.socket_path().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(config.socket_path().exists(), "broker did not start");

        Running {
            broker,
            config,
            db,
            handle,
            _tmp: tmp,
        }
    }

    fn report(uuid: &str, metrics: Value) -> Value {
        json!({
            "type": "Publish",
            "topic": "agent/message",
            "payload": json!({
                "agent": {"uuid": uuid, "name": "app", "username": "ops", "hostname": "web-01", "pid": 42},
                "metrics": metrics
            }).to_string()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_agent_lifecycle_over_socket() {
        let (broker, config, db, _tmp) = start().await;

        let mut dashboard = Client::connect(&config).await;
        dashboard
            .send(json!({"type": "Subscribe", "topics": ["agent/#"]}))
            .await;
        assert_eq!(dashboard.next().await["type"], "Ok");

        let mut agent = Client::connect(&config).await;
        agent
            .send(json!({"type": "Handshake", "client": "agent", "version": "1.0"}))
            .await;
        let hello = agent.next().await;
        assert_eq!(hello["type"], "HandshakeOk");
        assert!(!hello["session_id"].as_str().unwrap().is_empty());

        agent
            .send(report(
                "a-1",
                json!([{"type": "cpu", "value": 0.5}, {"type": "mem", "value": "512"}]),
            ))
            .await;
        assert_eq!(agent.next().await["type"], "Ok");

        let connected = dashboard.wait_push("agent/connected").await;
        assert_eq!(connected["agent"]["uuid"], "a-1");
        assert_eq!(connected["agent"]["connected"], true);
        assert_eq!(connected["agent"]["pid"], 42);

        // 断开连接 → disconnected 通知
        drop(agent);
        let disconnected = dashboard.wait_push("agent/disconnected").await;
        assert_eq!(disconnected, json!({"agent": {"uuid": "a-1"}}));

        broker.dispatcher().wait_idle().await;
        let stored = db.get_agent("a-1").unwrap().unwrap();
        assert!(!stored.connected);
        assert_eq!(db.metric_count("a-1").unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_frames_are_rejected_or_ignored() {
        let (broker, config, db, _tmp) = start().await;
        let mut client = Client::connect(&config).await;

        // 非 JSON 帧
        client.send_raw("{not json").await;
        let err = client.next().await;
        assert_eq!(err["type"], "Error");
        assert_eq!(err["code"], 400);

        // 带通配符的发布 topic
        client
            .send(json!({"type": "Publish", "topic": "agent/#", "payload": "{}"}))
            .await;
        assert_eq!(client.next().await["code"], 400);

        // 格式错误的遥测：接受转发，但不写入
        client
            .send(json!({"type": "Publish", "topic": "agent/message", "payload": "[1,2]"}))
            .await;
        assert_eq!(client.next().await["type"], "Ok");

        // 连接仍然可用
        client.send(json!({"type": "Heartbeat"})).await;
        assert_eq!(client.next().await["type"], "Ok");

        broker.dispatcher().wait_idle().await;
        assert_eq!(db.get_stats().unwrap().agent_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_announces_again() {
        let (broker, config, db, _tmp) = start().await;

        let mut dashboard = Client::connect(&config).await;
        dashboard
            .send(json!({"type": "Subscribe", "topics": ["agent/+"]}))
            .await;
        assert_eq!(dashboard.next().await["type"], "Ok");

        for round in 0..2 {
            let mut agent = Client::connect(&config).await;
            agent.send(report("a-9", json!([{"type": "n", "value": round}]))).await;
            assert_eq!(agent.next().await["type"], "Ok");

            let connected = dashboard.wait_push("agent/connected").await;
            assert_eq!(connected["agent"]["uuid"], "a-9");

            drop(agent);
            let disconnected = dashboard.wait_push("agent/disconnected").await;
            assert_eq!(disconnected["agent"]["uuid"], "a-9");
        }

        broker.dispatcher().wait_idle().await;
        assert_eq!(db.list_agents().unwrap().len(), 1);
        assert_eq!(db.metric_count("a-9").unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_non_utf8_frame_keeps_session_open() {
        let (broker, config, _db, _tmp) = start().await;
        let mut client = Client::connect(&config).await;

        client.send_bytes(&[0xff, 0xfe, b'\n']).await;
        let err = client.next().await;
        assert_eq!(err["type"], "Error");
        assert_eq!(err["code"], 400);

        client.send(json!({"type": "Heartbeat"})).await;
        assert_eq!(client.next().await["type"], "Ok");

        broker.dispatcher().wait_idle().await;
        assert_eq!(broker.dispatcher().registry().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_frame_closes_connection() {
        let running = start_with(|config| config.max_frame_len = 64).await;
        let mut client = Client::connect(&running.config).await;

        // 小于上限的帧正常处理
        client.send(json!({"type": "Heartbeat"})).await;
        assert_eq!(client.next().await["type"], "Ok");

        // 没有换行的超长帧
        client.send_bytes(&[b'x'; 200]).await;
        let err = client.next().await;
        assert_eq!(err["type"], "Error");
        assert_eq!(err["code"], 413);

        let closed = tokio::time::timeout(Duration::from_secs(5), client.lines.next_line())
            .await
            .expect("timed out waiting for close");
        assert!(!matches!(closed, Ok(Some(_))));

        running.broker.dispatcher().wait_idle().await;
        assert!(running.broker.dispatcher().registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_disconnects_live_agents() {
        let running = start_with(|_| {}).await;

        let mut dashboard = Client::connect(&running.config).await;
        dashboard
            .send(json!({"type": "Subscribe", "topics": ["agent/+"]}))
            .await;
        assert_eq!(dashboard.next().await["type"], "Ok");

        let mut agent = Client::connect(&running.config).await;
        agent.send(report("a-5", json!([]))).await;
        assert_eq!(agent.next().await["type"], "Ok");
        dashboard.wait_push("agent/connected").await;
        assert!(running.db.get_agent("a-5").unwrap().unwrap().connected);

        // 致命错误触发停机，agent 连接仍然开着
        running.broker.dispatcher().reporter().report(
            &HubError::Fatal("stop".into()),
            &ErrorContext::session("test"),
        );

        let disconnected = dashboard.wait_push("agent/disconnected").await;
        assert_eq!(disconnected["agent"]["uuid"], "a-5");

        let result = tokio::time::timeout(Duration::from_secs(10), running.handle)
            .await
            .expect("broker did not stop")
            .unwrap();
        assert!(result.is_err());
        assert!(!running.db.get_agent("a-5").unwrap().unwrap().connected);
        assert!(!running.config.socket_path().exists());
        drop(agent);
    }
}
