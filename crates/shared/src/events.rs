//! 事件模型
//!
//! 定义从变更流消费的消息创建事件，以及投递到告警 topic 的告警事件。
//! 线上格式沿用客户端文档库的 camelCase 字段名。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message: 消息创建事件
// ---------------------------------------------------------------------------

/// 新建的会话消息
///
/// 由客户端写入路径创建后不再修改，对本服务只读。
/// 消息正文不在事件中，通知只携带未读角标。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "id")]
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// 缺省按私聊处理，私聊消息不进入群通知扇出
    #[serde(default)]
    pub is_group_message: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DeliveryAlert: 告警事件
// ---------------------------------------------------------------------------

/// 告警类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// 会话不存在，事件被丢弃
    EventDropped,
    /// 事件整体处理失败（存储持续不可用等），等待重投或巡检
    EventFailed,
    /// 某个接收者的推送重试耗尽
    DeliveryFailed,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EventDropped => "EVENT_DROPPED",
            Self::EventFailed => "EVENT_FAILED",
            Self::DeliveryFailed => "DELIVERY_FAILED",
        };
        write!(f, "{s}")
    }
}

/// 告警事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAlert {
    pub kind: AlertKind,
    pub message_id: String,
    pub conversation_id: String,
    /// 接收者级别告警才有值
    pub recipient_id: Option<String>,
    pub reason: String,
    pub source_service: String,
    pub raised_at: DateTime<Utc>,
}

impl DeliveryAlert {
    pub fn new(
        kind: AlertKind,
        message: &Message,
        recipient_id: Option<&str>,
        reason: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            recipient_id: recipient_id.map(String::from),
            reason: reason.into(),
            source_service: source_service.into(),
            raised_at: Utc::now(),
        }
    }
}
