//! 告警出口
//!
//! 被丢弃的事件、整体失败的事件和重试耗尽的投递都要让运维看到。
//! 告警永远不会让调用方失败：投递告警本身出错时退化为错误日志。

use async_trait::async_trait;
use notify_shared::events::{AlertKind, DeliveryAlert, Message};
use notify_shared::kafka::{KafkaProducer, topics};
use tracing::error;

use crate::SERVICE_NAME;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: DeliveryAlert);

    /// 会话不存在等无法恢复的原因导致事件被丢弃
    async fn event_dropped(&self, message: &Message, reason: &str) {
        self.raise(DeliveryAlert::new(
            AlertKind::EventDropped,
            message,
            None,
            reason,
            SERVICE_NAME,
        ))
        .await;
    }

    /// 事件整体处理失败，等待重投或巡检
    async fn event_failed(&self, message: &Message, reason: &str) {
        self.raise(DeliveryAlert::new(
            AlertKind::EventFailed,
            message,
            None,
            reason,
            SERVICE_NAME,
        ))
        .await;
    }

    /// 某个接收者的推送重试耗尽
    async fn delivery_failed(&self, message: &Message, recipient_id: &str, reason: &str) {
        self.raise(DeliveryAlert::new(
            AlertKind::DeliveryFailed,
            message,
            Some(recipient_id),
            reason,
            SERVICE_NAME,
        ))
        .await;
    }
}

/// 投递到 Kafka 告警 topic
pub struct KafkaAlertSink {
    producer: KafkaProducer,
}

impl KafkaAlertSink {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl AlertSink for KafkaAlertSink {
    async fn raise(&self, alert: DeliveryAlert) {
        if let Err(e) = self
            .producer
            .send_json(topics::NOTIFICATION_ALERTS, &alert.message_id, &alert)
            .await
        {
            error!(
                kind = %alert.kind,
                message_id = %alert.message_id,
                conversation_id = %alert.conversation_id,
                recipient_id = ?alert.recipient_id,
                reason = %alert.reason,
                error = %e,
                "告警投递失败，仅记录日志"
            );
        }
    }
}

/// 只写错误日志
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: DeliveryAlert) {
        error!(
            kind = %alert.kind,
            message_id = %alert.message_id,
            conversation_id = %alert.conversation_id,
            recipient_id = ?alert.recipient_id,
            reason = %alert.reason,
            "通知告警"
        );
    }
}
