//! 投递账本
//!
//! 以 (message_id, recipient_id) 为键记录投递状态，是把"至少一次"的事件投递
//! 转换为"每个接收者恰好一次"逻辑通知的幂等边界。
//!
//! 状态机：`UNSEEN → CLAIMED → {SENT | FAILED_PERMANENT}`。
//! - 认领带租约；租约过期的 `CLAIMED` 记录可被重新认领（崩溃恢复）。
//! - 每次认领生成新的 claim_token，只有持有当前令牌的一方才能推进状态。
//! - `SENT` / `FAILED_PERMANENT` 为终态，记录永不删除。

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::Message;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 账本模型
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// 已认领、处理中
    Claimed,
    Sent,
    FailedPermanent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "CLAIMED",
            Self::Sent => "SENT",
            Self::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Claimed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // PENDING 是旧称，与 CLAIMED 等价
            "CLAIMED" | "PENDING" => Ok(Self::Claimed),
            "SENT" => Ok(Self::Sent),
            "FAILED_PERMANENT" => Ok(Self::FailedPermanent),
            other => Err(NotifyError::Internal(format!("未知的投递状态: {other}"))),
        }
    }
}

/// 一条投递记录
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub recipient_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub message_created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// 当前认领者的令牌，终态时为 None
    pub claim_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// 被认领的次数，首次为 1
    pub attempts: u32,
    /// 为该接收者计算过的角标，重新认领时复用，避免重复自增未读数
    pub badge: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// 首次认领时创建的记录
    pub fn claimed(
        message: &Message,
        recipient_id: &str,
        claim_token: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.message_id.clone(),
            recipient_id: recipient_id.to_string(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            message_created_at: message.created_at,
            status: DeliveryStatus::Claimed,
            claim_token: Some(claim_token.to_string()),
            lease_expires_at: Some(lease_expires_at),
            attempts: 1,
            badge: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 处于 `CLAIMED` 且租约已过期
    pub fn is_claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Claimed
            && self.lease_expires_at.is_none_or(|expires| expires < now)
    }

    /// 从记录还原消息，供巡检重新分发
    pub fn message(&self) -> Message {
        Message {
            message_id: self.message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            is_group_message: true,
            created_at: self.message_created_at,
        }
    }
}

/// 成功认领的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub message_id: String,
    pub recipient_id: String,
    pub claim_token: String,
    pub attempt: u32,
    pub badge: Option<u64>,
}

impl Claim {
    pub fn new_token() -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Claim),
    /// 已有终态，或另一个工作者持有未过期的认领
    AlreadyHandled,
}

// ---------------------------------------------------------------------------
// DeliveryLedger trait
// ---------------------------------------------------------------------------

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// 原子地检查并认领，同一键的并发调用只有一个得到 `Claimed`
    async fn try_claim(
        &self,
        message: &Message,
        recipient_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// 延长租约，返回调用方是否仍持有认领
    ///
    /// 推送前调用：返回 false 说明认领已被他人接管，不应再发送。
    async fn renew(&self, claim: &Claim, lease_expires_at: DateTime<Utc>) -> Result<bool>;

    /// 记录本次计算的角标，仅当调用方仍持有认领时生效
    async fn record_badge(&self, claim: &Claim, badge: u64) -> Result<()>;

    /// 将认领推进到终态，返回是否生效（认领已被他人接管时为 false）
    async fn complete(&self, claim: &Claim, status: DeliveryStatus) -> Result<bool>;

    async fn get(&self, message_id: &str, recipient_id: &str) -> Result<Option<DeliveryRecord>>;

    /// 租约已过期但仍为 `CLAIMED` 的记录，按过期时间升序
    async fn expired_claims(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<DeliveryRecord>>;
}

pub(crate) fn ensure_terminal(status: DeliveryStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(NotifyError::Internal(
            "complete 只能推进到 SENT 或 FAILED_PERMANENT".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL 实现
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    message_id: String,
    recipient_id: String,
    conversation_id: String,
    sender_id: String,
    message_created_at: DateTime<Utc>,
    status: String,
    claim_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    attempts: i32,
    badge: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = NotifyError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Self {
            message_id: row.message_id,
            recipient_id: row.recipient_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            message_created_at: row.message_created_at,
            status: row.status.parse()?,
            claim_token: row.claim_token,
            lease_expires_at: row.lease_expires_at,
            attempts: row.attempts.max(0) as u32,
            badge: row.badge.map(|b| b.max(0) as u64),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT message_id, recipient_id, conversation_id, sender_id, message_created_at,
           status, claim_token, lease_expires_at, attempts, badge, created_at, updated_at
    FROM delivery_records
"#;

/// 基于 `delivery_records` 表的投递账本
///
/// 认领使用 `INSERT ... ON CONFLICT DO UPDATE ... WHERE`：
/// 行不存在时插入，存在时只有"仍为 CLAIMED 且租约过期"才会被更新，
/// 整个判断在一条语句内由行锁保证原子性。
#[derive(Clone)]
pub struct PgDeliveryLedger {
    pool: PgPool,
}

impl PgDeliveryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for PgDeliveryLedger {
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    async fn try_claim(
        &self,
        message: &Message,
        recipient_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let claim_token = Claim::new_token();

        let row: Option<(i32, Option<i64>)> = sqlx::query_as(
            r#"
            INSERT INTO delivery_records
                (message_id, recipient_id, conversation_id, sender_id, message_created_at,
                 status, claim_token, lease_expires_at, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'CLAIMED', $6, $7, 1, $8, $8)
            ON CONFLICT (message_id, recipient_id) DO UPDATE
            SET claim_token = EXCLUDED.claim_token,
                lease_expires_at = EXCLUDED.lease_expires_at,
                attempts = delivery_records.attempts + 1,
                updated_at = EXCLUDED.updated_at
            WHERE delivery_records.status = 'CLAIMED'
              AND delivery_records.lease_expires_at < EXCLUDED.updated_at
            RETURNING attempts, badge
            "#,
        )
        .bind(&message.message_id)
        .bind(recipient_id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(message.created_at)
        .bind(&claim_token)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((attempts, badge)) => {
                if attempts > 1 {
                    warn!(recipient_id, attempts, "重新认领租约过期的投递");
                }
                Ok(ClaimOutcome::Claimed(Claim {
                    message_id: message.message_id.clone(),
                    recipient_id: recipient_id.to_string(),
                    claim_token,
                    attempt: attempts.max(1) as u32,
                    badge: badge.map(|b| b.max(0) as u64),
                }))
            }
            None => {
                debug!(recipient_id, "投递已处理或正在处理，跳过");
                Ok(ClaimOutcome::AlreadyHandled)
            }
        }
    }

    async fn renew(&self, claim: &Claim, lease_expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET lease_expires_at = $4, updated_at = NOW()
            WHERE message_id = $1 AND recipient_id = $2
              AND claim_token = $3 AND status = 'CLAIMED'
            "#,
        )
        .bind(&claim.message_id)
        .bind(&claim.recipient_id)
        .bind(&claim.claim_token)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_badge(&self, claim: &Claim, badge: u64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET badge = $4, updated_at = NOW()
            WHERE message_id = $1 AND recipient_id = $2
              AND claim_token = $3 AND status = 'CLAIMED'
            "#,
        )
        .bind(&claim.message_id)
        .bind(&claim.recipient_id)
        .bind(&claim.claim_token)
        .bind(i64::try_from(badge).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                message_id = %claim.message_id,
                recipient_id = %claim.recipient_id,
                "认领已被接管，角标未记录"
            );
        }
        Ok(())
    }

    async fn complete(&self, claim: &Claim, status: DeliveryStatus) -> Result<bool> {
        ensure_terminal(status)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = $4, claim_token = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE message_id = $1 AND recipient_id = $2
              AND claim_token = $3 AND status = 'CLAIMED'
            "#,
        )
        .bind(&claim.message_id)
        .bind(&claim.recipient_id)
        .bind(&claim.claim_token)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, message_id: &str, recipient_id: &str) -> Result<Option<DeliveryRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE message_id = $1 AND recipient_id = $2");
        let row: Option<DeliveryRow> = sqlx::query_as(&sql)
            .bind(message_id)
            .bind(recipient_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DeliveryRecord::try_from).transpose()
    }

    async fn expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'CLAIMED' AND lease_expires_at < $1 \
             ORDER BY lease_expires_at LIMIT $2"
        );
        let rows: Vec<DeliveryRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use notify_shared::database::Database;
    use notify_shared::test_utils::{
        MessageBuilder, test_conversation_id, test_database_config, test_user_id,
    };

    #[test]
    fn test_status_round_trip_and_legacy_name() {
        for status in [
            DeliveryStatus::Claimed,
            DeliveryStatus::Sent,
            DeliveryStatus::FailedPermanent,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert_eq!(
            "PENDING".parse::<DeliveryStatus>().unwrap(),
            DeliveryStatus::Claimed
        );
        assert!("UNSEEN".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DeliveryStatus::Claimed.is_terminal());
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::FailedPermanent.is_terminal());
        assert!(ensure_terminal(DeliveryStatus::Claimed).is_err());
    }

    #[test]
    fn test_claim_expiry() {
        let now = Utc::now();
        let msg = MessageBuilder::new("c1", "S").build();
        let mut record = DeliveryRecord::claimed(&msg, "A", "tok", now, now + Duration::seconds(30));

        assert!(!record.is_claim_expired(now));
        assert!(record.is_claim_expired(now + Duration::seconds(31)));

        record.status = DeliveryStatus::Sent;
        assert!(!record.is_claim_expired(now + Duration::days(1)));
    }

    #[test]
    fn test_record_rebuilds_message() {
        let now = Utc::now();
        let msg = MessageBuilder::new("c1", "S").id("m1").build();
        let record = DeliveryRecord::claimed(&msg, "A", "tok", now, now);
        assert_eq!(record.message(), msg);
    }

    // ---- PostgreSQL ----

    async fn pg_ledger() -> PgDeliveryLedger {
        let db = Database::connect(&test_database_config()).await.unwrap();
        db.run_migrations().await.unwrap();
        PgDeliveryLedger::new(db.pool().clone())
    }

    async fn claim_once(
        ledger: &PgDeliveryLedger,
        msg: &Message,
        recipient: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Claim {
        match ledger.try_claim(msg, recipient, now, now + lease).await.unwrap() {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::AlreadyHandled => panic!("认领应成功"),
        }
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_concurrent_claims_have_single_winner_against_postgres() {
        let ledger = pg_ledger().await;
        let msg = MessageBuilder::new(&test_conversation_id(), "S").build();
        let recipient = test_user_id();
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let (ledger, msg, recipient) = (ledger.clone(), msg.clone(), recipient.clone());
                tokio::spawn(async move {
                    ledger
                        .try_claim(&msg, &recipient, now, now + Duration::seconds(60))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if matches!(task.await.unwrap().unwrap(), ClaimOutcome::Claimed(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let record = ledger.get(&msg.message_id, &recipient).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Claimed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_expired_claim_is_reclaimed_with_badge_against_postgres() {
        let ledger = pg_ledger().await;
        let msg = MessageBuilder::new(&test_conversation_id(), "S").build();
        let recipient = test_user_id();
        let now = Utc::now();

        let first = claim_once(&ledger, &msg, &recipient, now, Duration::seconds(30)).await;
        ledger.record_badge(&first, 9).await.unwrap();

        // 租约内不可重新认领
        assert_eq!(
            ledger
                .try_claim(&msg, &recipient, now, now + Duration::seconds(30))
                .await
                .unwrap(),
            ClaimOutcome::AlreadyHandled
        );

        let later = now + Duration::seconds(31);
        let second = claim_once(&ledger, &msg, &recipient, later, Duration::seconds(30)).await;
        assert_eq!(second.attempt, 2);
        assert_eq!(second.badge, Some(9));
        assert_ne!(second.claim_token, first.claim_token);

        // 旧持有者既不能续租也不能写终态
        assert!(!ledger.renew(&first, later + Duration::seconds(60)).await.unwrap());
        assert!(!ledger.complete(&first, DeliveryStatus::Sent).await.unwrap());

        assert!(ledger.renew(&second, later + Duration::seconds(60)).await.unwrap());
        assert!(ledger.complete(&second, DeliveryStatus::Sent).await.unwrap());

        let record = ledger.get(&msg.message_id, &recipient).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert!(record.claim_token.is_none());
        assert!(record.lease_expires_at.is_none());
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_expired_claims_ordering_and_limit_against_postgres() {
        let ledger = pg_ledger().await;
        // 使用远早于其他测试数据的时间窗口，避免互相干扰
        let base = DateTime::parse_from_rfc3339("2001-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        sqlx::query("DELETE FROM delivery_records WHERE lease_expires_at < $1")
            .bind(base + Duration::days(1))
            .execute(&ledger.pool)
            .await
            .unwrap();

        let recipients: Vec<String> = (0..3).map(|_| test_user_id()).collect();
        for (idx, recipient) in recipients.iter().enumerate() {
            let msg = MessageBuilder::new(&test_conversation_id(), "S").build();
            let expires = base + Duration::seconds(30 - 10 * idx as i64);
            ledger.try_claim(&msg, recipient, base, expires).await.unwrap();
        }

        let now = base + Duration::minutes(1);
        let expired = ledger.expired_claims(now, 2).await.unwrap();
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].recipient_id, recipients[2]);
        assert_eq!(expired[1].recipient_id, recipients[1]);
        assert!(expired.iter().all(|r| r.is_claim_expired(now)));
    }
}
