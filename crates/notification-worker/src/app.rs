//! 按配置装配协作者
//!
//! `storage.backend` 选择 PostgreSQL + Redis 或进程内存储，
//! `push.provider` 选择 HTTP 网关或日志推送，`alerts.sink` 选择 Kafka 或日志告警。

use std::sync::Arc;

use anyhow::{Result, bail};
use notify_shared::cache::Cache;
use notify_shared::config::AppConfig;
use notify_shared::database::Database;
use notify_shared::kafka::KafkaProducer;
use tracing::{info, warn};

use crate::alert::{AlertSink, KafkaAlertSink, LogAlertSink};
use crate::dispatcher::Collaborators;
use crate::ledger::PgDeliveryLedger;
use crate::memory::{
    InMemoryConversationStore, InMemoryDeliveryLedger, InMemoryTokenStore, InMemoryUnreadCounter,
};
use crate::push::{HttpPushService, LoggingPushService, PushDeliveryService};
use crate::resolver::PgConversationStore;
use crate::tokens::PgTokenStore;
use crate::unread::RedisUnreadCounter;

/// 装配好的协作者，以及需要在退出时关闭的连接
pub struct Backends {
    pub collaborators: Collaborators,
    database: Option<Database>,
}

impl Backends {
    pub async fn close(self) {
        if let Some(db) = self.database {
            db.close().await;
        }
    }
}

pub async fn build_backends(config: &AppConfig) -> Result<Backends> {
    let push = build_push(config)?;
    let alerts = build_alerts(config)?;

    match config.storage.backend.to_ascii_lowercase().as_str() {
        "postgres" => {
            let db = Database::connect(&config.database).await?;
            db.run_migrations().await?;
            info!("数据库连接已建立");

            let cache = Cache::new(&config.redis)?;
            cache.health_check().await?;
            info!("Redis 连接已建立");

            let pool = db.pool().clone();
            Ok(Backends {
                collaborators: Collaborators {
                    conversations: Arc::new(PgConversationStore::new(pool.clone())),
                    tokens: Arc::new(PgTokenStore::new(pool.clone())),
                    unread: Arc::new(RedisUnreadCounter::new(cache, config.redis.dedup_ttl())),
                    ledger: Arc::new(PgDeliveryLedger::new(pool)),
                    push,
                    alerts,
                },
                database: Some(db),
            })
        }
        "memory" => {
            if config.is_production() {
                bail!("生产环境不允许使用进程内存储");
            }
            warn!("使用进程内存储，数据不会持久化，仅用于本地运行");
            Ok(Backends {
                collaborators: Collaborators {
                    conversations: Arc::new(InMemoryConversationStore::new()),
                    tokens: Arc::new(InMemoryTokenStore::new()),
                    unread: Arc::new(InMemoryUnreadCounter::new()),
                    ledger: Arc::new(InMemoryDeliveryLedger::new()),
                    push,
                    alerts,
                },
                database: None,
            })
        }
        other => bail!("未知的存储后端: {other}"),
    }
}

fn build_push(config: &AppConfig) -> Result<Arc<dyn PushDeliveryService>> {
    match config.push.provider.to_ascii_lowercase().as_str() {
        "http" => Ok(Arc::new(HttpPushService::new(&config.push)?)),
        "log" => {
            info!("推送使用日志模式，不会真正发送");
            Ok(Arc::new(LoggingPushService))
        }
        other => bail!("未知的推送服务: {other}"),
    }
}

fn build_alerts(config: &AppConfig) -> Result<Arc<dyn AlertSink>> {
    match config.alerts.sink.to_ascii_lowercase().as_str() {
        "kafka" => Ok(Arc::new(KafkaAlertSink::new(KafkaProducer::new(
            &config.kafka,
        )?))),
        "log" => Ok(Arc::new(LogAlertSink)),
        other => bail!("未知的告警出口: {other}"),
    }
}
