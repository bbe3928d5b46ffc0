//! 数据库连接和操作

use crate::config::{ConnectionMode, DbConfig};
use crate::error::{Error, Result};
use crate::schema;
use crate::types::{Agent, AgentUpsert, Metric, MetricInput, Stats};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// SQLite 忙等待超时
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const AGENT_COLUMNS: &str =
    "uuid, name, username, hostname, pid, connected, created_at, updated_at";

/// 数据库连接
///
/// 内部共享同一个 `Connection`，clone 开销很小（用于 `spawn_blocking`）。
#[derive(Clone)]
pub struct HubDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl HubDB {
    /// 连接数据库
    pub fn connect(config: DbConfig) -> Result<Self> {
        let conn = match config.mode {
            ConnectionMode::Local => Self::open_local(&config)?,
            ConnectionMode::Memory => Connection::open_in_memory()?,
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(schema::PRAGMAS_SQL)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::info!("数据库已连接: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 打开本地 SQLite 文件（WAL 模式）
    fn open_local(config: &DbConfig) -> Result<Connection> {
        let path = Path::new(&config.url);

        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("journal_mode={}", mode);
        Ok(conn)
    }

    // ==================== Agent 操作 ====================

    /// 按 uuid 创建或更新 Agent
    ///
    /// 已存在时只覆盖 `Some` 字段和 `connected`，`created_at` 不变。
    pub fn upsert_agent(&self, input: &AgentUpsert) -> Result<Agent> {
        if input.uuid.is_empty() {
            return Err(Error::Invalid("agent uuid 不能为空".into()));
        }

        let conn = self.conn.lock();
        let now = current_time_ms();

        conn.execute(
            r#"
            INSERT INTO agents (uuid, name, username, hostname, pid, connected, created_at, updated_at)
            VALUES (?1, COALESCE(?2, ''), COALESCE(?3, ''), COALESCE(?4, ''), COALESCE(?5, 0), ?6, ?7, ?7)
            ON CONFLICT(uuid) DO UPDATE SET
                name = COALESCE(?2, agents.name),
                username = COALESCE(?3, agents.username),
                hostname = COALESCE(?4, agents.hostname),
                pid = COALESCE(?5, agents.pid),
                connected = ?6,
                updated_at = ?7
            "#,
            params![
                input.uuid,
                input.name,
                input.username,
                input.hostname,
                input.pid,
                input.connected,
                now
            ],
        )?;

        query_agent(&conn, &input.uuid)?
            .ok_or_else(|| Error::NotFound(format!("agent {}", input.uuid)))
    }

    /// 获取单个 Agent
    pub fn get_agent(&self, uuid: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        query_agent(&conn, uuid)
    }

    /// 获取所有 Agents（按 updated_at 倒序）
    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        self.list_agents_where("1 = 1")
    }

    /// 获取在线的 Agents
    pub fn list_connected_agents(&self) -> Result<Vec<Agent>> {
        self.list_agents_where("connected = 1")
    }

    fn list_agents_where(&self, filter: &str) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents WHERE {} ORDER BY updated_at DESC, id DESC",
            AGENT_COLUMNS, filter
        ))?;

        let rows = stmt.query_map([], agent_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 启动时把所有 Agent 标记为断开
    ///
    /// 进程重启后没有任何会话存活，上次异常退出残留的 connected=1 需要清掉。
    pub fn reset_connected(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE agents SET connected = 0, updated_at = ?1 WHERE connected = 1",
            params![current_time_ms()],
        )?;
        Ok(count)
    }

    // ==================== Metric 操作 ====================

    /// 写入一条 Metric
    pub fn insert_metric(&self, agent_uuid: &str, input: &MetricInput) -> Result<Metric> {
        let conn = self.conn.lock();

        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM agents WHERE uuid = ?1",
                params![agent_uuid],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("agent {}", agent_uuid)));
        }

        let now = current_time_ms();
        let timestamp = input.timestamp.unwrap_or(now);
        conn.execute(
            "INSERT INTO metrics (agent_uuid, type, value, timestamp, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_uuid, input.metric_type, input.value, timestamp, now],
        )?;

        Ok(Metric {
            id: conn.last_insert_rowid(),
            agent_uuid: agent_uuid.to_string(),
            metric_type: input.metric_type.clone(),
            value: input.value.clone(),
            timestamp,
            created_at: now,
        })
    }

    /// 获取 Agent 的 Metrics（按写入顺序）
    pub fn list_metrics(&self, agent_uuid: &str, limit: usize) -> Result<Vec<Metric>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, agent_uuid, type, value, timestamp, created_at
            FROM metrics
            WHERE agent_uuid = ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![agent_uuid, limit as i64], |row| {
            Ok(Metric {
                id: row.get(0)?,
                agent_uuid: row.get(1)?,
                metric_type: row.get(2)?,
                value: row.get(3)?,
                timestamp: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 获取 Agent 的 Metric 数量
    pub fn metric_count(&self, agent_uuid: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE agent_uuid = ?1",
            params![agent_uuid],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Agent 总数
    pub fn agent_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        Ok(count)
    }

    // ==================== 统计 ====================

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();

        let agent_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        let connected_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE connected = 1",
            [],
            |row| row.get(0),
        )?;
        let metric_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;

        Ok(Stats {
            agent_count,
            connected_count,
            metric_count,
        })
    }
}

fn query_agent(conn: &Connection, uuid: &str) -> Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {} FROM agents WHERE uuid = ?1", AGENT_COLUMNS),
        params![uuid],
        agent_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        uuid: row.get(0)?,
        name: row.get(1)?,
        username: row.get(2)?,
        hostname: row.get(3)?,
        pid: row.get(4)?,
        connected: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> HubDB {
        HubDB::connect(DbConfig::memory()).unwrap()
    }

    fn upsert(uuid: &str, name: &str, connected: bool) -> AgentUpsert {
        AgentUpsert {
            uuid: uuid.to_string(),
            name: Some(name.to_string()),
            connected,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_keeps_unset_fields() {
        let db = memory_db();

        let first = AgentUpsert {
            uuid: "a-1".to_string(),
            name: Some("app".to_string()),
            username: Some("ops".to_string()),
            hostname: Some("web-01".to_string()),
            pid: Some(42),
            connected: true,
        };
        db.upsert_agent(&first).unwrap();

        // 第二次只带 name，其他字段保持不变
        let agent = db.upsert_agent(&upsert("a-1", "renamed", false)).unwrap();
        assert_eq!(agent.name, "renamed");
        assert_eq!(agent.username, "ops");
        assert_eq!(agent.hostname, "web-01");
        assert_eq!(agent.pid, 42);
        assert!(!agent.connected);
        assert_eq!(db.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_rejects_empty_uuid() {
        let db = memory_db();

        let err = db.upsert_agent(&upsert("", "app", true)).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert_eq!(db.agent_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_metric_requires_agent() {
        let db = memory_db();
        let input = MetricInput {
            metric_type: "cpu".to_string(),
            value: "0.5".to_string(),
            timestamp: None,
        };

        let err = db.insert_metric("missing", &input).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_reset_connected() {
        let db = memory_db();
        db.upsert_agent(&upsert("a-1", "one", true)).unwrap();
        db.upsert_agent(&upsert("a-2", "two", true)).unwrap();
        db.upsert_agent(&upsert("a-3", "three", false)).unwrap();

        assert_eq!(db.reset_connected().unwrap(), 2);
        assert!(db.list_connected_agents().unwrap().is_empty());
    }
}
