//! Redis 缓存管理模块
//!
//! 提供 Redis 连接管理和计数器类原子操作封装。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{NotifyError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// 按标记键去重的自增
///
/// 标记存在时直接返回它记录的值；否则自增计数并把新值写入标记。
/// 两步在同一个脚本内执行，不会出现"已自增但未记标记"的中间状态。
const INCR_ONCE_SCRIPT: &str = r#"
    local applied = redis.call("get", KEYS[2])
    if applied then
        return tonumber(applied)
    end
    local value = redis.call("incrby", KEYS[1], ARGV[1])
    redis.call("set", KEYS[2], value, "EX", ARGV[2])
    return value
"#;

/// Redis 客户端
///
/// 多路复用连接在首次使用时建立，之后所有调用共享；命令出错时丢弃，下次调用重新建立。
#[derive(Clone)]
pub struct Cache {
    client: Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl Cache {
    /// 创建 Redis 客户端（惰性连接，首次操作时才建立连接）
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(None)),
        })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::from)?;
        *slot = Some(conn.clone());
        debug!("Redis 多路复用连接已建立");
        Ok(conn)
    }

    async fn with_conn<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_conn().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.conn.write().await.take();
                Err(NotifyError::from(e))
            }
        }
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        self.with_conn(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    /// 原子自增并返回新值
    ///
    /// 基于 Redis INCRBY，单键操作在服务端串行执行，不会丢失并发更新。
    #[instrument(skip(self))]
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_conn(|mut conn| async move { conn.incr(key, delta).await })
            .await
    }

    /// 每个标记键只生效一次的自增
    ///
    /// 第一次调用自增 `key` 并把结果记在 `marker_key` 上（`marker_ttl` 后过期）；
    /// 标记过期前的重复调用返回同一个值，不再自增。
    #[instrument(skip(self))]
    pub async fn incr_once(
        &self,
        key: &str,
        marker_key: &str,
        delta: i64,
        marker_ttl: Duration,
    ) -> Result<i64> {
        let ttl_secs = marker_ttl.as_secs().max(1);
        self.with_conn(|mut conn| async move {
            redis::Script::new(INCR_ONCE_SCRIPT)
                .key(key)
                .key(marker_key)
                .arg(delta)
                .arg(ttl_secs)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    /// 读取整数值，key 不存在时返回 None
    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.with_conn(|mut conn| async move { conn.get(key).await })
            .await
    }
}

/// 缓存键生成器
pub struct CacheKey;

impl CacheKey {
    /// 用户在某个会话中的未读数
    pub fn unread_count(user_id: &str, conversation_id: &str) -> String {
        format!("unread:{}:{}", user_id, conversation_id)
    }

    /// 某条消息已为某用户计入未读数的标记
    pub fn unread_applied(message_id: &str, user_id: &str) -> String {
        format!("unread:applied:{}:{}", message_id, user_id)
    }
}
