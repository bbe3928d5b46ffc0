//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 输入不合法
    #[error("参数无效: {0}")]
    Invalid(String),

    /// 记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),

    /// 后台任务失败（spawn_blocking 被取消或 panic）
    #[error("后台任务失败: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
