//! 配置
//!
//! - [`DbConfig`]: 数据库连接配置
//! - [`HubConfig`]: Hub 进程配置（数据目录、socket、PID 文件）

use std::path::PathBuf;

/// 数据目录环境变量
pub const ENV_DATA_DIR: &str = "TELEMETRY_HUB_DIR";

/// 数据库 URL 环境变量
pub const ENV_DB_URL: &str = "TELEMETRY_HUB_DB_URL";

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 连接 URL
    /// - 本地: "/path/to/telemetry.db"
    /// - 内存: ":memory:"（测试用，进程退出即丢失）
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 内存数据库
    Memory,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
        }
    }

    /// 创建内存数据库配置
    pub fn memory() -> Self {
        Self {
            url: ":memory:".to_string(),
            mode: ConnectionMode::Memory,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var(ENV_DB_URL) {
            if url == ":memory:" {
                return Self::memory();
            }
            return Self::local(url);
        }

        Self::local(default_data_dir().join("db").join("telemetry.db"))
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::Memory => None,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 默认单帧上限 1 MiB
const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 数据目录（默认 ~/.telemetry-hub）
    pub data_dir: PathBuf,
    /// 数据库配置
    pub db: DbConfig,
    /// 每个连接的出站队列容量（满了就丢弃推送）
    pub outbound_capacity: usize,
    /// 单帧最大字节数（不含换行），超出后断开连接
    pub max_frame_len: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db: DbConfig::local(data_dir.join("db").join("telemetry.db")),
            data_dir,
            outbound_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl HubConfig {
    /// 使用指定数据目录（数据库放在 `<data_dir>/db/telemetry.db`）
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        let data_dir = data_dir.into();
        Self {
            db: DbConfig::local(data_dir.join("db").join("telemetry.db")),
            data_dir,
            ..Default::default()
        }
    }

    /// 从环境变量创建配置
    pub fn from_env() -> Self {
        let mut config = match std::env::var(ENV_DATA_DIR) {
            Ok(dir) => Self::with_data_dir(dir),
            Err(_) => Self::default(),
        };
        if std::env::var(ENV_DB_URL).is_ok() {
            config.db = DbConfig::from_env();
        }
        config
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("hub.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("hub.pid")
    }

    /// 数据库路径（内存模式下为 None）
    pub fn db_path(&self) -> Option<PathBuf> {
        self.db.path()
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".telemetry-hub")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_paths() {
        let config = HubConfig::with_data_dir("/tmp/test-hub");

        assert_eq!(config.socket_path(), PathBuf::from("/tmp/test-hub/hub.sock"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/test-hub/hub.pid"));
        assert_eq!(
            config.db_path(),
            Some(PathBuf::from("/tmp/test-hub/db/telemetry.db"))
        );
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn test_memory_config_has_no_path() {
        let config = DbConfig::memory();
        assert_eq!(config.mode, ConnectionMode::Memory);
        assert!(config.path().is_none());
    }

    #[test]
    fn test_default_data_dir() {
        let config = HubConfig::default();
        assert!(config.data_dir.to_str().unwrap().contains(".telemetry-hub"));
    }
}
