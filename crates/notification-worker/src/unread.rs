//! 未读计数
//!
//! 每个 (用户, 会话) 一个非负计数。本服务只做原子自增与读取，
//! 归零由外部的已读回执写入方负责。
//!
//! 分发路径使用 `increment_for_message`：同一条消息对同一用户只计一次，
//! 进程在自增之后、记录角标之前崩溃时，重新认领拿到的是同一个值。

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::cache::{Cache, CacheKey};
use notify_shared::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnreadCounter: Send + Sync {
    /// 原子自增并返回新值，同一键的并发调用不会丢失更新
    async fn increment_and_get(&self, user_id: &str, conversation_id: &str) -> Result<u64>;

    /// 为一条消息自增一次并返回新值
    ///
    /// 同一 (消息, 用户) 的重复调用不再自增，返回第一次得到的值。
    async fn increment_for_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<u64>;

    /// 读取当前值，从未计数过时为 0
    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<u64>;
}

/// 基于 Redis INCR 的未读计数
#[derive(Clone)]
pub struct RedisUnreadCounter {
    cache: Cache,
    /// 去重标记的保留时长
    dedup_ttl: Duration,
}

impl RedisUnreadCounter {
    pub fn new(cache: Cache, dedup_ttl: Duration) -> Self {
        Self { cache, dedup_ttl }
    }
}

/// 外部写入方异常写入负数时按 0 处理，角标不能为负
fn clamp_badge(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

#[async_trait]
impl UnreadCounter for RedisUnreadCounter {
    async fn increment_and_get(&self, user_id: &str, conversation_id: &str) -> Result<u64> {
        let key = CacheKey::unread_count(user_id, conversation_id);
        let value = self.cache.incr(&key, 1).await?;
        Ok(clamp_badge(value))
    }

    async fn increment_for_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<u64> {
        let key = CacheKey::unread_count(user_id, conversation_id);
        let marker = CacheKey::unread_applied(message_id, user_id);
        let value = self
            .cache
            .incr_once(&key, &marker, 1, self.dedup_ttl)
            .await?;
        Ok(clamp_badge(value))
    }

    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<u64> {
        let key = CacheKey::unread_count(user_id, conversation_id);
        Ok(self.cache.get_i64(&key).await?.map(clamp_badge).unwrap_or(0))
    }
}
