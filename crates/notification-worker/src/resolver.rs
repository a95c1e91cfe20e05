//! 接收者解析
//!
//! 根据会话 ID 查出当前成员，排除发送者，得到本条消息的通知对象。
//! 会话成员由外部维护，本服务只读。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::error::Result;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::error::DispatchError;

/// 会话及其成员
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub conversation_id: String,
    pub participant_ids: Vec<String>,
}

/// 读取会话成员的能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 会话不存在时返回 `Ok(None)`
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
}

/// 接收者解析器
#[derive(Clone)]
pub struct ParticipantResolver {
    store: Arc<dyn ConversationStore>,
}

impl ParticipantResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// 返回除发送者外的全部成员（去重、有序）
    ///
    /// 会话缺失返回 `ConversationNotFound`；发送者不在成员中时照常返回全部成员。
    #[instrument(skip(self))]
    pub async fn resolve_recipients(
        &self,
        conversation_id: &str,
        sender_id: &str,
    ) -> std::result::Result<BTreeSet<String>, DispatchError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DispatchError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })?;

        let recipients: BTreeSet<String> = conversation
            .participant_ids
            .into_iter()
            .filter(|id| id != sender_id)
            .collect();

        debug!(
            conversation_id,
            recipients = recipients.len(),
            "已解析通知接收者"
        );
        Ok(recipients)
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL 实现
// ---------------------------------------------------------------------------

/// 基于 `conversations` / `conversation_participants` 表的会话存储
#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;

        if exists.is_none() {
            return Ok(None);
        }

        let participant_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT user_id FROM conversation_participants
            WHERE conversation_id = $1
            ORDER BY user_id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Conversation {
            conversation_id: conversation_id.to_string(),
            participant_ids,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use notify_shared::error::NotifyError;

    fn resolver_with(conversation: Option<Conversation>) -> ParticipantResolver {
        let mut store = MockConversationStore::new();
        store
            .expect_get_conversation()
            .with(eq("c1"))
            .times(1)
            .returning(move |_| Ok(conversation.clone()));
        ParticipantResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_excludes_sender() {
        let resolver = resolver_with(Some(Conversation {
            conversation_id: "c1".to_string(),
            participant_ids: vec!["A".to_string(), "B".to_string(), "S".to_string()],
        }));

        let recipients = resolver.resolve_recipients("c1", "S").await.unwrap();
        assert_eq!(
            recipients.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_members_collapse() {
        let resolver = resolver_with(Some(Conversation {
            conversation_id: "c1".to_string(),
            participant_ids: vec!["A".to_string(), "A".to_string(), "S".to_string()],
        }));

        let recipients = resolver.resolve_recipients("c1", "S").await.unwrap();
        assert_eq!(recipients.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_only_conversation_has_no_recipients() {
        let resolver = resolver_with(Some(Conversation {
            conversation_id: "c1".to_string(),
            participant_ids: vec!["S".to_string()],
        }));

        assert!(resolver.resolve_recipients("c1", "S").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let resolver = resolver_with(None);

        let err = resolver.resolve_recipients("c1", "S").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ConversationNotFound { ref conversation_id } if conversation_id == "c1"
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_error_propagates_as_retryable() {
        let mut store = MockConversationStore::new();
        store
            .expect_get_conversation()
            .returning(|_| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));
        let resolver = ParticipantResolver::new(Arc::new(store));

        let err = resolver.resolve_recipients("c1", "S").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
