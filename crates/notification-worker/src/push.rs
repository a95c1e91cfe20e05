//! 推送投递服务
//!
//! 通过 `PushDeliveryService` trait 抽象单个设备令牌的推送，调度器只关心三种结果：
//! 成功、可重试的瞬时失败、令牌永久失效。
//!
//! - `HttpPushService`：调用 FCM v1 风格的 HTTP 推送网关
//! - `LoggingPushService`：只记录日志，用于本地运行

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::PushConfig;
use notify_shared::error::{NotifyError, Result};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::PushError;

/// 推送负载：只携带定位信息和未读角标，不含消息正文
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub badge: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushDeliveryService: Send + Sync {
    /// 向单个设备令牌发送一次推送，不做重试
    async fn send(&self, token: &str, payload: &PushPayload) -> std::result::Result<(), PushError>;
}

// ---------------------------------------------------------------------------
// HTTP 推送网关
// ---------------------------------------------------------------------------

/// HTTP 推送网关客户端
pub struct HttpPushService {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpPushService {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Config(format!("创建推送 HTTP 客户端失败: {e}")))?;

        info!(endpoint = %config.endpoint, "HTTP 推送网关已配置");
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
        })
    }
}

/// 构造网关请求体
///
/// 角标同时写入 APNs 的 `aps.badge` 和 Android 的 `notification_count`，
/// `data` 中的值按网关要求全部为字符串。
fn request_body(token: &str, payload: &PushPayload) -> Value {
    json!({
        "message": {
            "token": token,
            "data": {
                "conversationId": payload.conversation_id,
                "messageId": payload.message_id,
                "senderId": payload.sender_id,
                "badge": payload.badge.to_string(),
            },
            "apns": {
                "payload": { "aps": { "badge": payload.badge } }
            },
            "android": {
                "notification": { "notification_count": payload.badge }
            }
        }
    })
}

/// 网关错误体中表示令牌失效的状态码
const INVALID_TOKEN_STATUSES: &[&str] = &["UNREGISTERED", "NOT_FOUND", "INVALID_ARGUMENT"];

/// 按 HTTP 状态码和错误体对网关响应分类
fn classify_response(status: StatusCode, body: &str) -> std::result::Result<(), PushError> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(PushError::InvalidToken(format!("HTTP {status}")));
    }

    if let Some(code) = error_status(body)
        && INVALID_TOKEN_STATUSES.contains(&code.as_str())
    {
        return Err(PushError::InvalidToken(code));
    }

    // 限流、5xx、鉴权失败以及无法识别的错误都按瞬时失败处理，交给有上限的重试
    Err(PushError::Transient(format!("HTTP {status}")))
}

/// 从错误体中提取失败原因：优先 `details[].errorCode`，其次 `error.status`
fn error_status(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    let detail_code = error
        .get("details")
        .and_then(Value::as_array)
        .and_then(|details| {
            details
                .iter()
                .find_map(|d| d.get("errorCode").and_then(Value::as_str))
        });

    detail_code
        .or_else(|| error.get("status").and_then(Value::as_str))
        .map(String::from)
}

fn classify_transport_error(err: &reqwest::Error) -> PushError {
    if err.is_timeout() {
        PushError::Transient("请求超时".to_string())
    } else if err.is_connect() {
        PushError::Transient(format!("连接失败: {err}"))
    } else {
        PushError::Transient(err.to_string())
    }
}

#[async_trait]
impl PushDeliveryService for HttpPushService {
    async fn send(&self, token: &str, payload: &PushPayload) -> std::result::Result<(), PushError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&request_body(token, payload));
        if let Some(auth) = &self.auth_token {
            request = request.bearer_auth(auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        let outcome = classify_response(status, &body);
        match &outcome {
            Ok(()) => debug!(
                message_id = %payload.message_id,
                badge = payload.badge,
                "推送已送达网关"
            ),
            Err(e) => warn!(
                message_id = %payload.message_id,
                status = %status,
                error = %e,
                "推送网关拒绝请求"
            ),
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// 日志推送
// ---------------------------------------------------------------------------

/// 只记录日志的推送服务，总是成功
pub struct LoggingPushService;

#[async_trait]
impl PushDeliveryService for LoggingPushService {
    async fn send(&self, token: &str, payload: &PushPayload) -> std::result::Result<(), PushError> {
        info!(
            conversation_id = %payload.conversation_id,
            message_id = %payload.message_id,
            sender_id = %payload.sender_id,
            badge = payload.badge,
            token_suffix = token_suffix(token),
            "模拟发送推送通知"
        );
        Ok(())
    }
}

/// 日志中只保留令牌末尾几位
pub(crate) fn token_suffix(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(5)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &token[start..]
}
