//! 通知扇出错误类型
//!
//! 区分"事件级"错误（会话不存在、负载无法解析、存储持续不可用）与
//! "推送级"错误（瞬时失败、令牌失效），便于上层决定丢弃、重试或清理令牌。

use notify_shared::error::NotifyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// 消息引用的会话不存在，重试也无法得到成员列表
    #[error("会话不存在: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("消息反序列化失败: {0}")]
    DeserializationFailed(String),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// 推送服务对单个令牌的发送结果（失败部分）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    /// 服务不可用、超时、限流等，可退避重试
    #[error("推送暂时失败: {0}")]
    Transient(String),

    /// 令牌已失效（应用卸载、注册过期），需要从令牌库移除
    #[error("推送令牌无效: {0}")]
    InvalidToken(String),
}

impl PushError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
