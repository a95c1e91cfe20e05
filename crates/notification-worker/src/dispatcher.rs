//! 通知分发器
//!
//! 对每条群消息：解析接收者 → 逐个认领 → 自增未读数 → 查询令牌 → 逐令牌推送。
//!
//! 错误按粒度隔离：
//! - 会话不存在：整条事件丢弃并告警，不重试
//! - 存储故障：只影响当前接收者，认领保持 `CLAIMED`，由租约过期后的重投或巡检接手
//! - 推送瞬时失败：有上限的指数退避；某接收者全部令牌都重试耗尽时记为 `FAILED_PERMANENT` 并告警
//! - 令牌失效：从令牌库移除，不算接收者失败
//!
//! 每次推送前续租并确认仍持有认领；等待发送许可时按租约的三分之一间隔续租。
//! 认领被巡检接管后立即停止发送，结果交给新的持有者。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use notify_shared::config::{DispatchConfig, PushConfig};
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::Message;
use notify_shared::observability::metrics;
use notify_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, instrument, warn};

use crate::alert::AlertSink;
use crate::error::{DispatchError, PushError};
use crate::ledger::{Claim, ClaimOutcome, DeliveryLedger, DeliveryStatus};
use crate::push::{PushDeliveryService, PushPayload, token_suffix};
use crate::resolver::{ConversationStore, ParticipantResolver};
use crate::tokens::TokenStore;
use crate::unread::UnreadCounter;

// ---------------------------------------------------------------------------
// 配置与协作者
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub recipient_concurrency: usize,
    pub max_in_flight_sends: usize,
    pub claim_lease: Duration,
    /// 单次推送尝试的时限，超时按瞬时失败处理
    pub send_timeout: Duration,
    pub push_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

impl DispatchSettings {
    pub fn from_config(dispatch: &DispatchConfig, push: &PushConfig) -> Self {
        Self {
            recipient_concurrency: dispatch.recipient_concurrency,
            max_in_flight_sends: dispatch.max_in_flight_sends,
            claim_lease: dispatch.claim_lease(),
            send_timeout: push.timeout(),
            push_retry: dispatch.retry.to_policy(),
            store_retry: dispatch.store_retry.to_policy(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default(), &PushConfig::default())
    }
}

/// 分发器依赖的全部外部能力
#[derive(Clone)]
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub unread: Arc<dyn UnreadCounter>,
    pub ledger: Arc<dyn DeliveryLedger>,
    pub push: Arc<dyn PushDeliveryService>,
    pub alerts: Arc<dyn AlertSink>,
}

// ---------------------------------------------------------------------------
// 分发结果
// ---------------------------------------------------------------------------

/// 单条消息的分发汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 解析出的接收者数量
    pub recipients: usize,
    pub sent: usize,
    pub failed_permanent: usize,
    /// 已有终态或他人正在处理
    pub already_handled: usize,
    /// 处理期间认领被他人接管，结果未写入
    pub superseded: usize,
    /// 存储故障或续租失败，认领保留待重试
    pub errored: usize,
    /// 实际调用推送服务的次数（含重试）
    pub sends_attempted: usize,
    pub tokens_pruned: usize,
    /// 会话不存在，事件被丢弃
    pub dropped: bool,
}

impl DispatchReport {
    fn dropped() -> Self {
        Self {
            dropped: true,
            ..Self::default()
        }
    }

    fn absorb(&mut self, result: RecipientResult) {
        match result.outcome {
            RecipientOutcome::Sent => self.sent += 1,
            RecipientOutcome::FailedPermanent => self.failed_permanent += 1,
            RecipientOutcome::AlreadyHandled => self.already_handled += 1,
            RecipientOutcome::Superseded => self.superseded += 1,
            RecipientOutcome::Errored => self.errored += 1,
        }
        self.sends_attempted += result.sends_attempted;
        self.tokens_pruned += result.tokens_pruned;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientOutcome {
    Sent,
    FailedPermanent,
    AlreadyHandled,
    Superseded,
    Errored,
}

impl RecipientOutcome {
    fn as_metric_label(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::FailedPermanent => "failed_permanent",
            Self::AlreadyHandled => "already_handled",
            Self::Superseded => "superseded",
            Self::Errored => "error",
        }
    }
}

#[derive(Debug)]
struct RecipientResult {
    outcome: RecipientOutcome,
    sends_attempted: usize,
    tokens_pruned: usize,
}

impl RecipientResult {
    fn bare(outcome: RecipientOutcome) -> Self {
        Self {
            outcome,
            sends_attempted: 0,
            tokens_pruned: 0,
        }
    }
}

/// 单个令牌的最终结果
#[derive(Debug)]
enum TokenOutcome {
    Delivered,
    /// 令牌被永久拒绝，已尝试移除
    Rejected { removed: bool },
    /// 瞬时失败且重试耗尽
    Exhausted(String),
    /// 认领已被接管，停止发送
    LeaseLost,
    /// 续租时存储故障，未能确认认领归属，放弃发送
    Abandoned(String),
}

/// 单次推送尝试的失败原因
#[derive(Debug)]
enum AttemptError {
    Push(PushError),
    LeaseLost,
    Store(NotifyError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Push(e) if e.is_transient())
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(e) => write!(f, "{e}"),
            Self::LeaseLost => f.write_str("认领已被其他工作者接管"),
            Self::Store(e) => write!(f, "续租失败: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationDispatcher
// ---------------------------------------------------------------------------

pub struct NotificationDispatcher {
    resolver: ParticipantResolver,
    tokens: Arc<dyn TokenStore>,
    unread: Arc<dyn UnreadCounter>,
    ledger: Arc<dyn DeliveryLedger>,
    push: Arc<dyn PushDeliveryService>,
    alerts: Arc<dyn AlertSink>,
    /// 进程级推送并发上限，所有事件共享
    send_permits: Arc<Semaphore>,
    lease: chrono::Duration,
    /// 等待发送许可时的续租间隔
    renew_interval: Duration,
    /// 单次推送时限，始终短于租约
    send_timeout: Duration,
    settings: DispatchSettings,
}

impl NotificationDispatcher {
    pub fn new(collaborators: Collaborators, settings: DispatchSettings) -> Self {
        let lease = chrono::Duration::from_std(settings.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let renew_interval = (settings.claim_lease / 3).max(Duration::from_millis(1));

        // 单次发送跨过整个租约时，续租也挡不住巡检接管
        let send_timeout = if settings.send_timeout < settings.claim_lease {
            settings.send_timeout
        } else {
            let clamped = settings.claim_lease / 2;
            warn!(
                send_timeout_ms = settings.send_timeout.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "推送时限不短于认领租约，已收紧"
            );
            clamped
        };

        Self {
            resolver: ParticipantResolver::new(collaborators.conversations),
            tokens: collaborators.tokens,
            unread: collaborators.unread,
            ledger: collaborators.ledger,
            push: collaborators.push,
            alerts: collaborators.alerts,
            send_permits: Arc::new(Semaphore::new(settings.max_in_flight_sends.max(1))),
            lease,
            renew_interval,
            send_timeout,
            settings,
        }
    }

    pub fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        self.ledger.clone()
    }

    pub fn alerts(&self) -> Arc<dyn AlertSink> {
        self.alerts.clone()
    }

    /// 分发一条群消息
    ///
    /// 可对同一消息重复调用：已有终态的接收者会被账本跳过。
    /// 只有接收者解析持续失败时返回错误，此时没有任何接收者被处理。
    #[instrument(
        skip(self, message),
        fields(message_id = %message.message_id, conversation_id = %message.conversation_id)
    )]
    pub async fn dispatch(&self, message: &Message) -> std::result::Result<DispatchReport, DispatchError> {
        let started = Instant::now();

        let resolver = &self.resolver;
        let resolved = retry_with_policy(
            &self.settings.store_retry,
            "resolve_recipients",
            DispatchError::is_retryable,
            move || resolver.resolve_recipients(&message.conversation_id, &message.sender_id),
        )
        .await;

        let recipients = match resolved {
            Ok(recipients) => recipients,
            Err(DispatchError::ConversationNotFound { conversation_id }) => {
                warn!(%conversation_id, "会话不存在，丢弃事件");
                self.alerts
                    .event_dropped(message, &format!("会话不存在: {conversation_id}"))
                    .await;
                metrics::record_event("dropped", None);
                return Ok(DispatchReport::dropped());
            }
            Err(e) => {
                metrics::record_event("failed", None);
                return Err(e);
            }
        };

        let report = self.fan_out(message, recipients).await;

        let elapsed = started.elapsed();
        metrics::record_event("dispatched", Some(elapsed.as_secs_f64()));
        info!(
            recipients = report.recipients,
            sent = report.sent,
            failed_permanent = report.failed_permanent,
            already_handled = report.already_handled,
            errored = report.errored,
            sends = report.sends_attempted,
            tokens_pruned = report.tokens_pruned,
            elapsed_ms = elapsed.as_millis() as u64,
            "消息分发完成"
        );
        Ok(report)
    }

    /// 对指定接收者重新投递，不再解析会话成员
    ///
    /// 用于巡检过期认领：认领之后才退出会话的成员也会完成投递，
    /// 不会因为不在当前成员列表中而永远停留在 `CLAIMED`。
    #[instrument(skip(self, message, recipients), fields(message_id = %message.message_id))]
    pub async fn redeliver(
        &self,
        message: &Message,
        recipients: impl IntoIterator<Item = String>,
    ) -> DispatchReport {
        let report = self.fan_out(message, recipients).await;
        metrics::record_event("redelivered", None);
        info!(
            recipients = report.recipients,
            sent = report.sent,
            failed_permanent = report.failed_permanent,
            already_handled = report.already_handled,
            errored = report.errored,
            "过期认领重新投递完成"
        );
        report
    }

    async fn fan_out(
        &self,
        message: &Message,
        recipients: impl IntoIterator<Item = String>,
    ) -> DispatchReport {
        let recipients: Vec<String> = recipients.into_iter().collect();
        let mut report = DispatchReport {
            recipients: recipients.len(),
            ..DispatchReport::default()
        };

        let results: Vec<RecipientResult> = stream::iter(recipients)
            .map(|recipient_id| async move { self.deliver(message, &recipient_id).await })
            .buffer_unordered(self.settings.recipient_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            report.absorb(result);
        }
        report
    }

    /// 处理单个接收者，存储故障在这里被吸收
    async fn deliver(&self, message: &Message, recipient_id: &str) -> RecipientResult {
        let result = match self.try_deliver(message, recipient_id).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    recipient_id,
                    error = %e,
                    error_code = e.code(),
                    "处理接收者失败，认领保留待租约过期后重试"
                );
                RecipientResult::bare(RecipientOutcome::Errored)
            }
        };
        metrics::record_recipient(result.outcome.as_metric_label());
        result
    }

    async fn try_deliver(&self, message: &Message, recipient_id: &str) -> Result<RecipientResult> {
        let now = Utc::now();
        let lease_expires_at = now + self.lease;
        let ledger = &self.ledger;

        let claim = match self
            .with_store_retry("try_claim", move || {
                ledger.try_claim(message, recipient_id, now, lease_expires_at)
            })
            .await?
        {
            ClaimOutcome::AlreadyHandled => {
                debug!(recipient_id, "接收者已处理，跳过");
                return Ok(RecipientResult::bare(RecipientOutcome::AlreadyHandled));
            }
            ClaimOutcome::Claimed(claim) => claim,
        };

        let badge = self.badge_for(message, &claim).await?;

        let tokens = &self.tokens;
        let device_tokens = self
            .with_store_retry("get_tokens", move || tokens.get_tokens(recipient_id))
            .await?;

        if device_tokens.is_empty() {
            debug!(recipient_id, "接收者没有设备令牌，直接记为已发送");
            let outcome = self.finish(message, &claim, DeliveryStatus::Sent, None).await?;
            return Ok(RecipientResult::bare(outcome));
        }

        let payload = PushPayload {
            conversation_id: message.conversation_id.clone(),
            message_id: message.message_id.clone(),
            sender_id: message.sender_id.clone(),
            badge,
        };

        let attempts = AtomicUsize::new(0);
        let token_outcomes = futures::future::join_all(
            device_tokens
                .iter()
                .map(|token| self.send_to_token(&claim, token, &payload, &attempts)),
        )
        .await;
        let sends_attempted = attempts.load(Ordering::Relaxed);
        let tokens_pruned = token_outcomes
            .iter()
            .filter(|o| matches!(o, TokenOutcome::Rejected { removed: true }))
            .count();

        if token_outcomes
            .iter()
            .any(|o| matches!(o, TokenOutcome::LeaseLost))
        {
            warn!(
                recipient_id,
                attempt = claim.attempt,
                "推送期间认领被接管，交给新的持有者完成"
            );
            return Ok(RecipientResult {
                outcome: RecipientOutcome::Superseded,
                sends_attempted,
                tokens_pruned,
            });
        }
        if let Some(reason) = token_outcomes.iter().find_map(|o| match o {
            TokenOutcome::Abandoned(reason) => Some(reason.as_str()),
            _ => None,
        }) {
            error!(
                recipient_id,
                %reason,
                "无法确认认领归属，认领保留待租约过期后重试"
            );
            return Ok(RecipientResult {
                outcome: RecipientOutcome::Errored,
                sends_attempted,
                tokens_pruned,
            });
        }

        let delivered = token_outcomes
            .iter()
            .any(|o| matches!(o, TokenOutcome::Delivered));
        let exhausted: Vec<&str> = token_outcomes
            .iter()
            .filter_map(|o| match o {
                TokenOutcome::Exhausted(reason) => Some(reason.as_str()),
                _ => None,
            })
            .collect();

        let (status, failure) = if delivered || exhausted.is_empty() {
            (DeliveryStatus::Sent, None)
        } else {
            (
                DeliveryStatus::FailedPermanent,
                Some(format!("全部令牌重试耗尽: {}", exhausted.join("; "))),
            )
        };

        let outcome = self
            .finish(message, &claim, status, failure.as_deref())
            .await?;

        Ok(RecipientResult {
            outcome,
            sends_attempted,
            tokens_pruned,
        })
    }

    /// 取得本次推送的角标
    ///
    /// 重新认领时复用账本里记录的值。自增按 (消息, 接收者) 去重，
    /// 因此可以重试，账本记录失败也只影响下次重新认领时多一次计数器查询。
    async fn badge_for(&self, message: &Message, claim: &Claim) -> Result<u64> {
        if let Some(badge) = claim.badge {
            debug!(
                recipient_id = %claim.recipient_id,
                badge,
                attempt = claim.attempt,
                "复用已记录的角标"
            );
            return Ok(badge);
        }

        let unread = &self.unread;
        let badge = self
            .with_store_retry("increment_unread", move || {
                unread.increment_for_message(
                    &claim.recipient_id,
                    &message.conversation_id,
                    &message.message_id,
                )
            })
            .await?;

        let ledger = &self.ledger;
        if let Err(e) = self
            .with_store_retry("record_badge", move || ledger.record_badge(claim, badge))
            .await
        {
            warn!(
                recipient_id = %claim.recipient_id,
                badge,
                error = %e,
                "记录角标失败，继续推送"
            );
        }
        Ok(badge)
    }

    /// 续租；认领已被接管时返回 `LeaseLost`
    async fn renew_lease(&self, claim: &Claim) -> std::result::Result<(), AttemptError> {
        let ledger = &self.ledger;
        let lease_expires_at = Utc::now() + self.lease;
        let renewed = self
            .with_store_retry("renew_claim", move || ledger.renew(claim, lease_expires_at))
            .await
            .map_err(AttemptError::Store)?;

        if renewed {
            Ok(())
        } else {
            Err(AttemptError::LeaseLost)
        }
    }

    /// 等待发送许可，每等满一个续租间隔就续租一次
    async fn acquire_send_permit(
        &self,
        claim: &Claim,
    ) -> std::result::Result<SemaphorePermit<'_>, AttemptError> {
        loop {
            match tokio::time::timeout(self.renew_interval, self.send_permits.acquire()).await {
                Ok(Ok(permit)) => return Ok(permit),
                Ok(Err(_)) => {
                    return Err(AttemptError::Push(PushError::Transient(
                        "发送许可已关闭".to_string(),
                    )));
                }
                Err(_) => {
                    debug!(
                        recipient_id = %claim.recipient_id,
                        "等待发送许可超过续租间隔，先续租"
                    );
                    self.renew_lease(claim).await?;
                }
            }
        }
    }

    /// 向单个令牌推送，瞬时失败按策略退避重试
    async fn send_to_token(
        &self,
        claim: &Claim,
        token: &str,
        payload: &PushPayload,
        attempts: &AtomicUsize,
    ) -> TokenOutcome {
        let recipient_id = claim.recipient_id.as_str();
        let send_timeout = self.send_timeout;

        let result = retry_with_policy(
            &self.settings.push_retry,
            "push_send",
            AttemptError::is_retryable,
            move || async move {
                let _permit = self.acquire_send_permit(claim).await?;
                self.renew_lease(claim).await?;

                attempts.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(send_timeout, self.push.send(token, payload)).await {
                    Ok(sent) => sent.map_err(AttemptError::Push),
                    Err(_) => Err(AttemptError::Push(PushError::Transient(format!(
                        "推送超时 ({}ms)",
                        send_timeout.as_millis()
                    )))),
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                metrics::record_push_send("success");
                TokenOutcome::Delivered
            }
            Err(AttemptError::LeaseLost) => {
                metrics::record_push_send("lease_lost");
                TokenOutcome::LeaseLost
            }
            Err(AttemptError::Store(e)) => {
                warn!(
                    recipient_id,
                    token_suffix = token_suffix(token),
                    error = %e,
                    "续租失败，放弃该令牌的推送"
                );
                TokenOutcome::Abandoned(e.to_string())
            }
            Err(AttemptError::Push(PushError::InvalidToken(reason))) => {
                metrics::record_push_send("invalid_token");
                info!(
                    recipient_id,
                    token_suffix = token_suffix(token),
                    %reason,
                    "推送令牌已失效，从令牌库移除"
                );
                let tokens = &self.tokens;
                let removed = match self
                    .with_store_retry("invalidate_token", move || {
                        tokens.invalidate(recipient_id, token)
                    })
                    .await
                {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(recipient_id, error = %e, "移除失效令牌失败，下次推送时再处理");
                        false
                    }
                };
                if removed {
                    metrics::record_token_pruned();
                }
                TokenOutcome::Rejected { removed }
            }
            Err(AttemptError::Push(PushError::Transient(reason))) => {
                metrics::record_push_send("exhausted");
                warn!(
                    recipient_id,
                    token_suffix = token_suffix(token),
                    %reason,
                    "推送重试耗尽"
                );
                TokenOutcome::Exhausted(reason)
            }
        }
    }

    /// 写入终态；失败终态成功写入时告警
    async fn finish(
        &self,
        message: &Message,
        claim: &Claim,
        status: DeliveryStatus,
        failure: Option<&str>,
    ) -> Result<RecipientOutcome> {
        let ledger = &self.ledger;
        let applied = self
            .with_store_retry("complete_claim", move || ledger.complete(claim, status))
            .await?;

        if !applied {
            warn!(
                recipient_id = %claim.recipient_id,
                attempt = claim.attempt,
                %status,
                "认领已被其他工作者接管，放弃写入结果"
            );
            return Ok(RecipientOutcome::Superseded);
        }

        match status {
            DeliveryStatus::FailedPermanent => {
                let reason = failure.unwrap_or("推送失败");
                self.alerts
                    .delivery_failed(message, &claim.recipient_id, reason)
                    .await;
                Ok(RecipientOutcome::FailedPermanent)
            }
            _ => Ok(RecipientOutcome::Sent),
        }
    }

    async fn with_store_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_policy(
            &self.settings.store_retry,
            operation,
            NotifyError::is_retryable,
            op,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockDeliveryLedger;
    use crate::memory::{
        InMemoryConversationStore, InMemoryDeliveryLedger, InMemoryTokenStore,
        InMemoryUnreadCounter, RecordingAlertSink, RecordingPushService,
    };
    use crate::push::MockPushDeliveryService;
    use crate::tokens::MockTokenStore;
    use crate::unread::MockUnreadCounter;
    use notify_shared::events::AlertKind;
    use notify_shared::test_utils::MessageBuilder;

    fn fast_settings() -> DispatchSettings {
        let fast = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };
        DispatchSettings {
            recipient_concurrency: 4,
            max_in_flight_sends: 8,
            claim_lease: Duration::from_secs(60),
            send_timeout: Duration::from_secs(5),
            push_retry: fast.clone(),
            store_retry: fast,
        }
    }

    struct Fixture {
        conversations: Arc<InMemoryConversationStore>,
        tokens: Arc<InMemoryTokenStore>,
        unread: Arc<InMemoryUnreadCounter>,
        ledger: Arc<InMemoryDeliveryLedger>,
        push: Arc<RecordingPushService>,
        alerts: Arc<RecordingAlertSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conversations: Arc::new(InMemoryConversationStore::new()),
                tokens: Arc::new(InMemoryTokenStore::new()),
                unread: Arc::new(InMemoryUnreadCounter::new()),
                ledger: Arc::new(InMemoryDeliveryLedger::new()),
                push: Arc::new(RecordingPushService::new()),
                alerts: Arc::new(RecordingAlertSink::new()),
            }
        }

        fn collaborators(&self) -> Collaborators {
            Collaborators {
                conversations: self.conversations.clone(),
                tokens: self.tokens.clone(),
                unread: self.unread.clone(),
                ledger: self.ledger.clone(),
                push: self.push.clone(),
                alerts: self.alerts.clone(),
            }
        }

        fn dispatcher(&self) -> NotificationDispatcher {
            NotificationDispatcher::new(self.collaborators(), fast_settings())
        }
    }

    #[tokio::test]
    async fn test_missing_conversation_drops_with_alert() {
        let fx = Fixture::new();
        let msg = MessageBuilder::new("ghost", "S").build();

        let report = fx.dispatcher().dispatch(&msg).await.unwrap();

        assert!(report.dropped);
        assert_eq!(report.recipients, 0);
        assert!(fx.push.sends().is_empty());
        let dropped = fx.alerts.of_kind(AlertKind::EventDropped);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].message_id, msg.message_id);
    }

    #[tokio::test]
    async fn test_already_handled_recipients_are_skipped_silently() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);

        let mut ledger = MockDeliveryLedger::new();
        ledger
            .expect_try_claim()
            .times(1)
            .returning(|_, _, _, _| Ok(ClaimOutcome::AlreadyHandled));
        let mut unread = MockUnreadCounter::new();
        unread.expect_increment_for_message().times(0);
        let mut tokens = MockTokenStore::new();
        tokens.expect_get_tokens().times(0);

        let collaborators = Collaborators {
            ledger: Arc::new(ledger),
            unread: Arc::new(unread),
            tokens: Arc::new(tokens),
            ..fx.collaborators()
        };
        let dispatcher = NotificationDispatcher::new(collaborators, fast_settings());

        let report = dispatcher
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.already_handled, 1);
        assert_eq!(report.sends_attempted, 0);
        assert!(fx.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_reuses_recorded_badge() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "t1");

        let mut ledger = MockDeliveryLedger::new();
        ledger.expect_try_claim().returning(|msg, recipient, _, _| {
            Ok(ClaimOutcome::Claimed(Claim {
                message_id: msg.message_id.clone(),
                recipient_id: recipient.to_string(),
                claim_token: "tok-2".to_string(),
                attempt: 2,
                badge: Some(7),
            }))
        });
        ledger.expect_record_badge().times(0);
        ledger.expect_renew().returning(|_, _| Ok(true));
        ledger
            .expect_complete()
            .withf(|claim, status| claim.claim_token == "tok-2" && *status == DeliveryStatus::Sent)
            .times(1)
            .returning(|_, _| Ok(true));
        let mut unread = MockUnreadCounter::new();
        unread.expect_increment_for_message().times(0);
        let mut push = MockPushDeliveryService::new();
        push.expect_send()
            .withf(|token, payload| token == "t1" && payload.badge == 7)
            .times(1)
            .returning(|_, _| Ok(()));

        let collaborators = Collaborators {
            ledger: Arc::new(ledger),
            unread: Arc::new(unread),
            push: Arc::new(push),
            ..fx.collaborators()
        };
        let report = NotificationDispatcher::new(collaborators, fast_settings())
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.sends_attempted, 1);
    }

    #[tokio::test]
    async fn test_token_store_failure_is_contained_to_one_recipient() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "B", "S"]);

        let mut tokens = MockTokenStore::new();
        tokens
            .expect_get_tokens()
            .withf(|user| user == "A")
            .returning(|_| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));
        tokens
            .expect_get_tokens()
            .withf(|user| user == "B")
            .returning(|_| Ok(vec!["tb".to_string()]));

        let collaborators = Collaborators {
            tokens: Arc::new(tokens),
            ..fx.collaborators()
        };
        let msg = MessageBuilder::new("c1", "S").build();
        let report = NotificationDispatcher::new(collaborators, fast_settings())
            .dispatch(&msg)
            .await
            .unwrap();

        assert_eq!(report.errored, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(fx.push.sends_to("tb").len(), 1);

        let a = fx.ledger.get(&msg.message_id, "A").await.unwrap().unwrap();
        assert_eq!(a.status, DeliveryStatus::Claimed);
        assert_eq!(a.badge, Some(1));
        let b = fx.ledger.get(&msg.message_id, "B").await.unwrap().unwrap();
        assert_eq!(b.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_partial_token_failure_keeps_recipient_sent() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "good");
        fx.tokens.register("A", "flaky");
        fx.push
            .fail_always("flaky", PushError::Transient("503".to_string()));

        let msg = MessageBuilder::new("c1", "S").build();
        let report = fx.dispatcher().dispatch(&msg).await.unwrap();

        assert_eq!(report.sent, 1);
        // 1 次成功 + 1 次首发与 2 次重试
        assert_eq!(report.sends_attempted, 4);
        assert!(fx.alerts.of_kind(AlertKind::DeliveryFailed).is_empty());
        let record = fx.ledger.get(&msg.message_id, "A").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_retry_budget() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "t1");
        fx.push.script(
            "t1",
            vec![
                Err(PushError::Transient("429".to_string())),
                Err(PushError::Transient("503".to_string())),
            ],
        );

        let report = fx
            .dispatcher()
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.sends_attempted, 3);
    }

    #[test]
    fn test_settings_follow_config() {
        let config = DispatchConfig {
            recipient_concurrency: 3,
            claim_lease_seconds: 5,
            ..DispatchConfig::default()
        };
        let push = PushConfig {
            timeout_ms: 1_500,
            ..PushConfig::default()
        };
        let settings = DispatchSettings::from_config(&config, &push);
        assert_eq!(settings.recipient_concurrency, 3);
        assert_eq!(settings.claim_lease, Duration::from_secs(5));
        assert_eq!(settings.send_timeout, Duration::from_millis(1_500));
        assert_eq!(settings.push_retry.max_retries, config.retry.max_retries);
    }

    #[test]
    fn test_send_timeout_is_kept_inside_the_lease() {
        let fx = Fixture::new();
        let settings = DispatchSettings {
            claim_lease: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            ..fast_settings()
        };
        let dispatcher = NotificationDispatcher::new(fx.collaborators(), settings);
        assert_eq!(dispatcher.send_timeout, Duration::from_millis(500));
        assert!(dispatcher.renew_interval < Duration::from_secs(1));
    }

    /// 账本包装：角标永远记不上，其余操作照常
    struct BadgeLossLedger {
        inner: InMemoryDeliveryLedger,
    }

    #[async_trait::async_trait]
    impl DeliveryLedger for BadgeLossLedger {
        async fn try_claim(
            &self,
            message: &Message,
            recipient_id: &str,
            now: chrono::DateTime<Utc>,
            lease_expires_at: chrono::DateTime<Utc>,
        ) -> Result<ClaimOutcome> {
            self.inner
                .try_claim(message, recipient_id, now, lease_expires_at)
                .await
        }

        async fn renew(
            &self,
            claim: &Claim,
            lease_expires_at: chrono::DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.renew(claim, lease_expires_at).await
        }

        async fn record_badge(&self, _claim: &Claim, _badge: u64) -> Result<()> {
            Err(NotifyError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn complete(&self, claim: &Claim, status: DeliveryStatus) -> Result<bool> {
            self.inner.complete(claim, status).await
        }

        async fn get(
            &self,
            message_id: &str,
            recipient_id: &str,
        ) -> Result<Option<crate::ledger::DeliveryRecord>> {
            self.inner.get(message_id, recipient_id).await
        }

        async fn expired_claims(
            &self,
            now: chrono::DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<crate::ledger::DeliveryRecord>> {
            self.inner.expired_claims(now, limit).await
        }
    }

    /// 令牌库包装：前若干次查询失败
    struct FlakyTokenStore {
        inner: InMemoryTokenStore,
        failures_left: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TokenStore for FlakyTokenStore {
        async fn get_tokens(&self, user_id: &str) -> Result<Vec<String>> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(NotifyError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.get_tokens(user_id).await
        }

        async fn invalidate(&self, user_id: &str, token: &str) -> Result<bool> {
            self.inner.invalidate(user_id, token).await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_badge_is_not_counted_twice_on_reclaim() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        let tokens = InMemoryTokenStore::new();
        tokens.register("A", "t1");

        // 首轮：自增成功、角标未记录、令牌查询失败，认领停在 CLAIMED
        let collaborators = Collaborators {
            ledger: Arc::new(BadgeLossLedger {
                inner: InMemoryDeliveryLedger::new(),
            }),
            tokens: Arc::new(FlakyTokenStore {
                inner: tokens,
                failures_left: AtomicUsize::new(3),
            }),
            ..fx.collaborators()
        };
        let settings = DispatchSettings {
            claim_lease: Duration::from_millis(10),
            send_timeout: Duration::from_millis(5),
            ..fast_settings()
        };
        let dispatcher = NotificationDispatcher::new(collaborators, settings);
        let msg = MessageBuilder::new("c1", "S").build();

        let first = dispatcher.dispatch(&msg).await.unwrap();
        assert_eq!(first.errored, 1);
        assert_eq!(fx.unread.get("A", "c1").await.unwrap(), 1);

        // 租约过期后重投，重新认领拿不到记录的角标
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = dispatcher.dispatch(&msg).await.unwrap();

        assert_eq!(second.sent, 1);
        assert_eq!(fx.unread.get("A", "c1").await.unwrap(), 1);
        let sends = fx.push.sends_to("t1");
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].badge, 1);
    }

    #[tokio::test]
    async fn test_lost_claim_stops_sending() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "t1");

        let mut ledger = MockDeliveryLedger::new();
        ledger.expect_try_claim().returning(|msg, recipient, _, _| {
            Ok(ClaimOutcome::Claimed(Claim {
                message_id: msg.message_id.clone(),
                recipient_id: recipient.to_string(),
                claim_token: "stale".to_string(),
                attempt: 1,
                badge: Some(3),
            }))
        });
        ledger.expect_renew().times(1).returning(|_, _| Ok(false));
        ledger.expect_complete().times(0);
        let mut push = MockPushDeliveryService::new();
        push.expect_send().times(0);

        let collaborators = Collaborators {
            ledger: Arc::new(ledger),
            push: Arc::new(push),
            ..fx.collaborators()
        };
        let report = NotificationDispatcher::new(collaborators, fast_settings())
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.superseded, 1);
        assert_eq!(report.sends_attempted, 0);
        assert!(fx.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_renewal_failure_leaves_claim_for_retry() {
        let fx = Fixture::new();
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "t1");

        let mut ledger = MockDeliveryLedger::new();
        ledger.expect_try_claim().returning(|msg, recipient, _, _| {
            Ok(ClaimOutcome::Claimed(Claim {
                message_id: msg.message_id.clone(),
                recipient_id: recipient.to_string(),
                claim_token: "tok".to_string(),
                attempt: 1,
                badge: Some(1),
            }))
        });
        ledger
            .expect_renew()
            .returning(|_, _| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));
        ledger.expect_complete().times(0);

        let collaborators = Collaborators {
            ledger: Arc::new(ledger),
            ..fx.collaborators()
        };
        let report = NotificationDispatcher::new(collaborators, fast_settings())
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.errored, 1);
        assert!(fx.push.sends().is_empty());
    }

    #[tokio::test]
    async fn test_slow_send_times_out_as_transient() {
        let fx = Fixture {
            push: Arc::new(RecordingPushService::new().with_latency(Duration::from_millis(200))),
            ..Fixture::new()
        };
        fx.conversations.insert("c1", &["A", "S"]);
        fx.tokens.register("A", "t1");

        let settings = DispatchSettings {
            send_timeout: Duration::from_millis(20),
            push_retry: RetryPolicy {
                max_retries: 1,
                ..fast_settings().push_retry
            },
            ..fast_settings()
        };
        let report = NotificationDispatcher::new(fx.collaborators(), settings)
            .dispatch(&MessageBuilder::new("c1", "S").build())
            .await
            .unwrap();

        assert_eq!(report.failed_permanent, 1);
        assert_eq!(report.sends_attempted, 2);
        assert_eq!(fx.alerts.of_kind(AlertKind::DeliveryFailed).len(), 1);
    }

    #[test]
    fn test_report_absorbs_recipient_results() {
        let mut report = DispatchReport::default();
        report.absorb(RecipientResult {
            outcome: RecipientOutcome::Sent,
            sends_attempted: 2,
            tokens_pruned: 1,
        });
        report.absorb(RecipientResult::bare(RecipientOutcome::Errored));

        assert_eq!(report.sent, 1);
        assert_eq!(report.errored, 1);
        assert_eq!(report.sends_attempted, 2);
        assert_eq!(report.tokens_pruned, 1);
    }
}
