//! telemetry-hub - Agent 遥测接入
//!
//! 远程 Agent 通过发布/订阅连接上报 metrics，Hub 负责：
//!
//! - **会话对账**: 把传输层会话和持久化的 Agent 身份对上
//! - **遥测写入**: 按上报顺序写入 metrics
//! - **生命周期通知**: agent/connected、agent/disconnected 各只发一次
//!
//! # Feature Flags
//!
//! - `broker`: Unix Socket 发布/订阅 Broker + `telemetry-hub` 可执行文件
//!
//! # 架构
//!
//! 核心逻辑在 [`hub`] 中，只依赖 [`Store`] 和 [`hub::Publisher`] 两个 trait；
//! [`HubDB`]（SQLite）和 `broker::Broadcaster` 是默认实现。

pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "broker")]
pub mod broker;

// Re-exports
pub use config::{DbConfig, HubConfig};
pub use db::HubDB;
pub use error::{Error, Result};
pub use hub::{Dispatcher, HubContext, TransportEvent};
pub use protocol::{Push, Request, Response};
pub use store::Store;
pub use types::*;

#[cfg(feature = "broker")]
pub use broker::{cleanup_stale_hub, is_hub_running, Broker};
