//! 设备推送令牌存储
//!
//! 一个用户可以有零到多个令牌（多设备）。令牌的注册由外部写路径完成，
//! 本服务只读取，并在推送服务永久拒绝某个令牌时将其删除。

use async_trait::async_trait;
use notify_shared::error::Result;
use sqlx::PgPool;
use tracing::{debug, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// 查询用户当前的全部令牌，没有设备时返回空列表
    async fn get_tokens(&self, user_id: &str) -> Result<Vec<String>>;

    /// 删除单个令牌，返回是否真的删除了记录
    ///
    /// 令牌已不存在时返回 `Ok(false)`，并发重复调用是安全的。
    async fn invalidate(&self, user_id: &str, token: &str) -> Result<bool>;
}

/// 基于 `device_tokens` 表的令牌存储
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn get_tokens(&self, user_id: &str) -> Result<Vec<String>> {
        let tokens: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT token FROM device_tokens
            WHERE user_id = $1
            ORDER BY registered_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        debug!(user_id, tokens = tokens.len(), "已加载设备令牌");
        Ok(tokens)
    }

    async fn invalidate(&self, user_id: &str, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE user_id = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(user_id, "已移除失效的设备令牌");
        } else {
            debug!(user_id, "设备令牌已被移除，忽略");
        }
        Ok(removed)
    }
}
