//! telemetry-hub - Agent 遥测接入服务
//!
//! 负责：
//! - 发布/订阅 Broker（Unix Socket）
//! - 会话对账 + metrics 写入
//! - 生命周期通知

use std::sync::Arc;

use anyhow::Result;
use telemetry_hub::{cleanup_stale_hub, is_hub_running, Broker, HubConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("telemetry_hub=debug".parse()?))
        .init();

    tracing::info!("🚀 telemetry-hub v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = HubConfig::from_env();

    // 检查是否已有 Hub 运行
    if is_hub_running(&config) {
        tracing::error!("❌ Hub is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_hub(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 初始化（数据库就绪之后才开始接受连接）
    let broker = Arc::new(Broker::open(config)?);
    broker.run().await?;

    tracing::info!("👋 telemetry-hub exiting");
    Ok(())
}
