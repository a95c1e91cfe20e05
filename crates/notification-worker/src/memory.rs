//! 内存实现
//!
//! 使用 DashMap 实现全部协作者，适用于测试和本地开发（`storage.backend = "memory"`）。
//! 与持久化实现保持相同的原子性约定：计数自增、账本认领都在单个分片锁内完成。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use notify_shared::error::Result;
use notify_shared::events::{AlertKind, DeliveryAlert, Message};

use crate::alert::AlertSink;
use crate::error::PushError;
use crate::ledger::{
    Claim, ClaimOutcome, DeliveryLedger, DeliveryRecord, DeliveryStatus, ensure_terminal,
};
use crate::push::{PushDeliveryService, PushPayload};
use crate::resolver::{Conversation, ConversationStore};
use crate::tokens::TokenStore;
use crate::unread::UnreadCounter;

// ---------------------------------------------------------------------------
// 会话
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, Vec<String>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建或覆盖会话
    pub fn insert(&self, conversation_id: &str, participant_ids: &[&str]) {
        self.conversations.insert(
            conversation_id.to_string(),
            participant_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    pub fn add_participant(&self, conversation_id: &str, user_id: &str) {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(user_id.to_string());
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|participants| Conversation {
                conversation_id: conversation_id.to_string(),
                participant_ids: participants.clone(),
            }))
    }
}

// ---------------------------------------------------------------------------
// 设备令牌
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, Vec<String>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册令牌，重复注册忽略
    pub fn register(&self, user_id: &str, token: &str) {
        let mut tokens = self.tokens.entry(user_id.to_string()).or_default();
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_tokens(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tokens
            .get(user_id)
            .map(|tokens| tokens.clone())
            .unwrap_or_default())
    }

    async fn invalidate(&self, user_id: &str, token: &str) -> Result<bool> {
        let Some(mut tokens) = self.tokens.get_mut(user_id) else {
            return Ok(false);
        };
        let before = tokens.len();
        tokens.retain(|t| t != token);
        Ok(tokens.len() < before)
    }
}

// ---------------------------------------------------------------------------
// 未读计数
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryUnreadCounter {
    counts: DashMap<(String, String), u64>,
    /// (message_id, user_id) -> 该消息计入后的值
    applied: DashMap<(String, String), u64>,
}

impl InMemoryUnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, user_id: &str, conversation_id: &str) -> u64 {
        let mut count = self
            .counts
            .entry((user_id.to_string(), conversation_id.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    /// 模拟外部已读回执将计数清零
    pub fn reset(&self, user_id: &str, conversation_id: &str) {
        self.counts
            .insert((user_id.to_string(), conversation_id.to_string()), 0);
    }
}

#[async_trait]
impl UnreadCounter for InMemoryUnreadCounter {
    async fn increment_and_get(&self, user_id: &str, conversation_id: &str) -> Result<u64> {
        Ok(self.bump(user_id, conversation_id))
    }

    async fn increment_for_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<u64> {
        // 标记的分片锁覆盖整个自增，同一消息的并发调用只有一个会自增
        match self
            .applied
            .entry((message_id.to_string(), user_id.to_string()))
        {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let value = self.bump(user_id, conversation_id);
                entry.insert(value);
                Ok(value)
            }
        }
    }

    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<u64> {
        Ok(self
            .counts
            .get(&(user_id.to_string(), conversation_id.to_string()))
            .map(|count| *count)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// 投递账本
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryDeliveryLedger {
    records: DashMap<(String, String), DeliveryRecord>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部记录的快照
    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    fn owned_claim<'a>(
        &'a self,
        claim: &Claim,
    ) -> Option<dashmap::mapref::one::RefMut<'a, (String, String), DeliveryRecord>> {
        self.records
            .get_mut(&(claim.message_id.clone(), claim.recipient_id.clone()))
            .filter(|record| {
                record.status == DeliveryStatus::Claimed
                    && record.claim_token.as_deref() == Some(claim.claim_token.as_str())
            })
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn try_claim(
        &self,
        message: &Message,
        recipient_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let claim_token = Claim::new_token();
        let key = (message.message_id.clone(), recipient_id.to_string());

        match self.records.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(DeliveryRecord::claimed(
                    message,
                    recipient_id,
                    &claim_token,
                    now,
                    lease_expires_at,
                ));
                Ok(ClaimOutcome::Claimed(Claim {
                    message_id: message.message_id.clone(),
                    recipient_id: recipient_id.to_string(),
                    claim_token,
                    attempt: 1,
                    badge: None,
                }))
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if !record.is_claim_expired(now) {
                    return Ok(ClaimOutcome::AlreadyHandled);
                }

                record.claim_token = Some(claim_token.clone());
                record.lease_expires_at = Some(lease_expires_at);
                record.attempts += 1;
                record.updated_at = now;

                Ok(ClaimOutcome::Claimed(Claim {
                    message_id: message.message_id.clone(),
                    recipient_id: recipient_id.to_string(),
                    claim_token,
                    attempt: record.attempts,
                    badge: record.badge,
                }))
            }
        }
    }

    async fn renew(&self, claim: &Claim, lease_expires_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut record) = self.owned_claim(claim) else {
            return Ok(false);
        };
        record.lease_expires_at = Some(lease_expires_at);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_badge(&self, claim: &Claim, badge: u64) -> Result<()> {
        if let Some(mut record) = self.owned_claim(claim) {
            record.badge = Some(badge);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, claim: &Claim, status: DeliveryStatus) -> Result<bool> {
        ensure_terminal(status)?;

        let Some(mut record) = self.owned_claim(claim) else {
            return Ok(false);
        };
        record.status = status;
        record.claim_token = None;
        record.lease_expires_at = None;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get(&self, message_id: &str, recipient_id: &str) -> Result<Option<DeliveryRecord>> {
        Ok(self
            .records
            .get(&(message_id.to_string(), recipient_id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut expired: Vec<DeliveryRecord> = self
            .records
            .iter()
            .filter(|r| r.is_claim_expired(now))
            .map(|r| r.value().clone())
            .collect();
        expired.sort_by_key(|r| r.lease_expires_at);
        expired.truncate(limit);
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// 推送
// ---------------------------------------------------------------------------

/// 记录每一次发送的推送服务
///
/// 默认全部成功；可以按令牌预设一串结果（依次消费），或让某个令牌始终失败。
#[derive(Debug, Default)]
pub struct RecordingPushService {
    sends: Mutex<Vec<(String, PushPayload)>>,
    scripted: DashMap<String, VecDeque<std::result::Result<(), PushError>>>,
    always: DashMap<String, PushError>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// 发送结束（包括被取消）时归还在途计数
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingPushService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次发送前等待一段时间，用于制造并发重叠
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 预设令牌接下来的若干次结果
    pub fn script(&self, token: &str, outcomes: Vec<std::result::Result<(), PushError>>) {
        self.scripted
            .entry(token.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// 令牌的每次发送都返回该错误
    pub fn fail_always(&self, token: &str, error: PushError) {
        self.always.insert(token.to_string(), error);
    }

    /// 全部发送记录（含失败和超时的尝试）
    pub fn sends(&self) -> Vec<(String, PushPayload)> {
        self.sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 观察到的最大同时在途发送数
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn sends_to(&self, token: &str) -> Vec<PushPayload> {
        self.sends()
            .into_iter()
            .filter(|(t, _)| t == token)
            .map(|(_, payload)| payload)
            .collect()
    }

    fn next_outcome(&self, token: &str) -> std::result::Result<(), PushError> {
        if let Some(mut queue) = self.scripted.get_mut(token)
            && let Some(outcome) = queue.pop_front()
        {
            return outcome;
        }
        match self.always.get(token) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PushDeliveryService for RecordingPushService {
    async fn send(&self, token: &str, payload: &PushPayload) -> std::result::Result<(), PushError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        self.sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((token.to_string(), payload.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_outcome(token)
    }
}

// ---------------------------------------------------------------------------
// 告警
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<DeliveryAlert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<DeliveryAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn of_kind(&self, kind: AlertKind) -> Vec<DeliveryAlert> {
        self.alerts()
            .into_iter()
            .filter(|alert| alert.kind == kind)
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(&self, alert: DeliveryAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use notify_shared::test_utils::MessageBuilder;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_token_store_register_and_invalidate() {
        let store = InMemoryTokenStore::new();
        store.register("A", "t1");
        store.register("A", "t1");
        store.register("A", "t2");

        assert_eq!(store.get_tokens("A").await.unwrap(), vec!["t1", "t2"]);
        assert!(store.invalidate("A", "t1").await.unwrap());
        assert!(!store.invalidate("A", "t1").await.unwrap());
        assert!(!store.invalidate("nobody", "t1").await.unwrap());
        assert_eq!(store.get_tokens("A").await.unwrap(), vec!["t2"]);
        assert!(store.get_tokens("B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unread_counter_concurrent_increments() {
        let counter = Arc::new(InMemoryUnreadCounter::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.increment_and_get("A", "c1").await })
            })
            .collect();
        let mut seen: Vec<u64> = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap().unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
        assert_eq!(counter.get("A", "c1").await.unwrap(), 50);

        counter.reset("A", "c1");
        assert_eq!(counter.get("A", "c1").await.unwrap(), 0);
        assert_eq!(counter.increment_and_get("A", "c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unread_counter_counts_each_message_once() {
        let counter = Arc::new(InMemoryUnreadCounter::new());

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.increment_for_message("A", "c1", "m1").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }

        assert_eq!(
            counter.increment_for_message("A", "c1", "m2").await.unwrap(),
            2
        );
        // 同一消息对另一个用户单独计数
        assert_eq!(
            counter.increment_for_message("B", "c1", "m1").await.unwrap(),
            1
        );
        assert_eq!(counter.get("A", "c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ledger_single_winner_under_concurrency() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let msg = MessageBuilder::new("c1", "S").build();
        let now = Utc::now();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let (ledger, msg) = (ledger.clone(), msg.clone());
                tokio::spawn(async move {
                    ledger
                        .try_claim(&msg, "A", now, now + ChronoDuration::seconds(60))
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
    }

    #[tokio::test]
    async fn test_ledger_reclaim_after_lease_expiry_keeps_badge() {
        let ledger = InMemoryDeliveryLedger::new();
        let msg = MessageBuilder::new("c1", "S").build();
        let now = Utc::now();
        let lease = now + ChronoDuration::seconds(30);

        let ClaimOutcome::Claimed(first) = ledger.try_claim(&msg, "A", now, lease).await.unwrap()
        else {
            panic!("首次认领应成功");
        };
        ledger.record_badge(&first, 4).await.unwrap();

        // 租约内不可重新认领
        assert_eq!(
            ledger.try_claim(&msg, "A", now, lease).await.unwrap(),
            ClaimOutcome::AlreadyHandled
        );

        let later = lease + ChronoDuration::seconds(1);
        let ClaimOutcome::Claimed(second) = ledger
            .try_claim(&msg, "A", later, later + ChronoDuration::seconds(30))
            .await
            .unwrap()
        else {
            panic!("租约过期后应可重新认领");
        };
        assert_eq!(second.attempt, 2);
        assert_eq!(second.badge, Some(4));
        assert_ne!(second.claim_token, first.claim_token);

        // 旧持有者已失去所有权
        assert!(!ledger.renew(&first, later + ChronoDuration::seconds(60)).await.unwrap());
        assert!(!ledger.complete(&first, DeliveryStatus::Sent).await.unwrap());
        assert!(ledger.renew(&second, later + ChronoDuration::seconds(60)).await.unwrap());
        assert!(ledger.complete(&second, DeliveryStatus::Sent).await.unwrap());

        let record = ledger.get(&msg.message_id, "A").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert!(record.claim_token.is_none());

        // 终态不可再认领，即使时间继续推进
        let much_later = later + ChronoDuration::days(1);
        assert_eq!(
            ledger
                .try_claim(&msg, "A", much_later, much_later)
                .await
                .unwrap(),
            ClaimOutcome::AlreadyHandled
        );
    }

    #[tokio::test]
    async fn test_ledger_expired_claims_ordering_and_limit() {
        let ledger = InMemoryDeliveryLedger::new();
        let now = Utc::now();

        for (idx, recipient) in ["A", "B", "C"].iter().enumerate() {
            let msg = MessageBuilder::new("c1", "S").build();
            let expires = now - ChronoDuration::seconds(10 * (idx as i64 + 1));
            ledger.try_claim(&msg, recipient, now, expires).await.unwrap();
        }
        let fresh = MessageBuilder::new("c1", "S").build();
        ledger
            .try_claim(&fresh, "D", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap();

        let expired = ledger.expired_claims(now, 2).await.unwrap();
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].recipient_id, "C");
        assert_eq!(expired[1].recipient_id, "B");
    }

    #[tokio::test]
    async fn test_complete_rejects_non_terminal_status() {
        let ledger = InMemoryDeliveryLedger::new();
        let msg = MessageBuilder::new("c1", "S").build();
        let now = Utc::now();
        let ClaimOutcome::Claimed(claim) = ledger.try_claim(&msg, "A", now, now).await.unwrap()
        else {
            panic!("认领应成功");
        };

        assert!(ledger.complete(&claim, DeliveryStatus::Claimed).await.is_err());
    }

    #[tokio::test]
    async fn test_recording_push_scripted_outcomes() {
        let push = RecordingPushService::new();
        let payload = PushPayload {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            sender_id: "S".to_string(),
            badge: 1,
        };
        push.script("t1", vec![Err(PushError::Transient("503".to_string()))]);
        push.fail_always("t2", PushError::InvalidToken("UNREGISTERED".to_string()));

        assert!(push.send("t1", &payload).await.is_err());
        assert!(push.send("t1", &payload).await.is_ok());
        assert!(push.send("t2", &payload).await.is_err());
        assert!(push.send("t2", &payload).await.is_err());
        assert_eq!(push.sends_to("t1").len(), 2);
        assert_eq!(push.sends().len(), 4);
    }

    #[tokio::test]
    async fn test_recording_alert_sink_filters_by_kind() {
        let sink = RecordingAlertSink::new();
        let msg = MessageBuilder::new("c1", "S").build();

        sink.event_dropped(&msg, "会话不存在").await;
        sink.delivery_failed(&msg, "A", "重试耗尽").await;

        assert_eq!(sink.alerts().len(), 2);
        let failed = sink.of_kind(AlertKind::DeliveryFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].recipient_id.as_deref(), Some("A"));
    }
}
