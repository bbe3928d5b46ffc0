//! Broker 模块 - Unix Socket 发布/订阅传输
//!
//! - 每个连接对应一个会话，会话 ID 由 Broker 分配
//! - 发布的消息转发给匹配的订阅者
//! - 遥测 topic 的消息同时交给 Hub 处理
//! - Hub 的生命周期通知通过 [`Broadcaster`] 发出

mod broadcaster;
mod server;

pub use broadcaster::{topic_matches, valid_filter, Broadcaster, MessageSender};
pub use server::{cleanup_stale_hub, is_hub_running, Broker, BROKER_VERSION};
