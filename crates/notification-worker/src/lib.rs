//! 群消息推送通知扇出
//!
//! 消费消息创建事件，为群内除发送者外的每个成员推送一条携带未读角标的通知。
//! 以 (消息, 接收者) 为粒度去重，在至少一次的事件投递下保证每人恰好一条逻辑通知。

pub mod alert;
pub mod app;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod push;
pub mod resolver;
pub mod sweeper;
pub mod tokens;
pub mod unread;

pub use dispatcher::{Collaborators, DispatchReport, DispatchSettings, NotificationDispatcher};
pub use error::{DispatchError, PushError};

/// 服务名，用于加载配置和标记告警来源
pub const SERVICE_NAME: &str = "notification-worker";
