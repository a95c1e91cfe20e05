//! 消息事件消费者
//!
//! 从变更流消费消息创建事件，过滤出群消息后交给分发器。
//! 事件处理有结论后才保存偏移量；接收者解析持续失败时不保存，退避后重新处理同一事件。
//! 进程中途退出时事件会被重投，由投递账本去重。

use std::sync::Arc;

use notify_shared::config::KafkaConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::Message;
use notify_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};
use notify_shared::observability::metrics;
use notify_shared::observability::tracing::set_parent_from_headers;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatcher::{DispatchReport, NotificationDispatcher};
use crate::error::DispatchError;

/// 同一服务内的群消息消费组后缀
pub const CONSUMER_GROUP_SUFFIX: &str = "group-messages";

pub struct MessageEventConsumer {
    consumer: KafkaConsumer,
    dispatcher: Arc<NotificationDispatcher>,
    worker_id: usize,
}

impl MessageEventConsumer {
    pub fn new(
        config: &KafkaConfig,
        dispatcher: Arc<NotificationDispatcher>,
        worker_id: usize,
    ) -> Result<Self, DispatchError> {
        let consumer = KafkaConsumer::new(config, Some(CONSUMER_GROUP_SUFFIX))?;
        Ok(Self {
            consumer,
            dispatcher,
            worker_id,
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        self.consumer.subscribe(&[topics::MESSAGES_CREATED])?;

        let worker_id = self.worker_id;
        info!(worker_id, topic = topics::MESSAGES_CREATED, "消息事件消费者已启动");

        let dispatcher = self.dispatcher;
        self.consumer
            .start(shutdown, |msg| {
                let dispatcher = &dispatcher;
                async move {
                    let outcome = handle_message(dispatcher, &msg).await;
                    if outcome.should_commit() {
                        Ok(())
                    } else {
                        Err(NotifyError::Internal(format!(
                            "消息事件分发失败: partition={} offset={}",
                            msg.partition, msg.offset
                        )))
                    }
                }
            })
            .await;

        info!(worker_id, "消息事件消费者已停止");
        Ok(())
    }
}

/// 单条事件的处理结果
#[derive(Debug)]
pub enum HandleOutcome {
    /// 负载无法解析，重试也无法修复
    Undecodable,
    /// 非群消息
    Ignored,
    Dispatched(DispatchReport),
    /// 接收者解析持续失败，已告警，等待重投
    Failed,
}

impl HandleOutcome {
    /// 是否可以保存偏移量
    ///
    /// 只有 `Failed` 需要重新处理：此时还没有任何账本记录，巡检也找不到这条事件。
    pub fn should_commit(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// 处理单条 Kafka 消息
///
/// 拆分为独立函数，测试中可以直接调用而无需连接 Kafka。
pub async fn handle_message(
    dispatcher: &NotificationDispatcher,
    msg: &ConsumerMessage,
) -> HandleOutcome {
    let message: Message = match msg.deserialize_payload() {
        Ok(message) => message,
        Err(e) => {
            warn!(
                error = %e,
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "消息事件无法解析，跳过"
            );
            metrics::record_event("undecodable", None);
            return HandleOutcome::Undecodable;
        }
    };

    if !message.is_group_message {
        debug!(message_id = %message.message_id, "非群消息，忽略");
        metrics::record_event("ignored", None);
        return HandleOutcome::Ignored;
    }

    let span = info_span!(
        "message_event",
        message_id = %message.message_id,
        partition = msg.partition,
        offset = msg.offset
    );
    set_parent_from_headers(&span, &msg.headers);

    match dispatcher.dispatch(&message).instrument(span).await {
        Ok(report) => HandleOutcome::Dispatched(report),
        Err(e) => {
            error!(
                message_id = %message.message_id,
                conversation_id = %message.conversation_id,
                error = %e,
                "消息分发失败"
            );
            dispatcher
                .alerts()
                .event_failed(&message, &e.to_string())
                .await;
            HandleOutcome::Failed
        }
    }
}
