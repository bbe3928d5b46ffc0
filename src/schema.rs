//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Agents 表（uuid 由 Agent 自己生成，不可变）
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    hostname TEXT NOT NULL DEFAULT '',
    pid INTEGER NOT NULL DEFAULT 0,
    connected INTEGER NOT NULL DEFAULT 0,  -- 0=断开, 1=在线
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Metrics 表（只追加，不更新不删除）
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_uuid TEXT NOT NULL,
    type TEXT NOT NULL,
    value TEXT NOT NULL,
    timestamp INTEGER NOT NULL,     -- 采集时间 (毫秒)，payload 未提供时为写入时间
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),

    FOREIGN KEY (agent_uuid) REFERENCES agents(uuid)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_agents_connected ON agents(connected);
CREATE INDEX IF NOT EXISTS idx_metrics_agent ON metrics(agent_uuid, id);
CREATE INDEX IF NOT EXISTS idx_metrics_type ON metrics(agent_uuid, type);
"#;

/// 连接级 PRAGMA（每次打开连接都要执行）
pub const PRAGMAS_SQL: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;
