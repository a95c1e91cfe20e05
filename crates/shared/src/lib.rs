//! 共享库
//!
//! 通知扇出服务共用的配置、错误处理、数据库连接、Redis、Kafka、事件模型与可观测性基础设施。

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
pub mod test_utils;
