//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为 Producer/Consumer 抽象，统一消息序列化、
//! 错误映射和优雅关闭语义。
//!
//! 消费者采用"处理成功后再保存偏移量"的方式：进程在处理中途崩溃时，
//! 该消息会被重新投递，配合投递账本实现至少一次语义下的幂等发送。
//! handler 返回错误时不保存偏移量，退避后原地重试同一条消息。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::NotifyError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理 Kafka topic 名称
pub mod topics {
    /// 消息创建事件（变更流）
    pub const MESSAGES_CREATED: &str = "chat.messages.created";
    /// 投递失败与丢弃事件的告警
    pub const NOTIFICATION_ALERTS: &str = "chat.notifications.alerts";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, NotifyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| NotifyError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，Clone 成本很低。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 5 秒内无法投递即视为失败，由调用方决定降级方式
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), NotifyError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// Kafka 消费者
///
/// 封装 `StreamConsumer`，提供基于 `watch` channel 的优雅关闭语义。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    redelivery_backoff: Duration,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组。
    /// 关闭自动保存偏移量：只有 handler 返回后才保存，之后由自动提交刷到 broker。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, NotifyError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer,
            redelivery_backoff: config.redelivery_backoff(),
        })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// - 收到消息时调用 handler，成功后才保存该消息的偏移量。
    /// - handler 返回错误时不保存偏移量，退避后对同一条消息重试，
    ///   重试期间不会拉取后续消息，避免之后的偏移量越过它。
    /// - 关闭信号变为 `true` 时退出，正在执行的 handler 会先完成；
    ///   尚未成功的消息不保存偏移量，重启后重新消费。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), NotifyError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        'consume: loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match msg_result {
                        Ok(borrowed_msg) => ConsumerMessage::from_borrowed(&borrowed_msg),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    let (topic, partition, offset) = (msg.topic.clone(), msg.partition, msg.offset);

                    let mut failures: u32 = 0;
                    while let Err(e) = handler(msg.clone()).await {
                        failures += 1;
                        warn!(
                            error = %e,
                            topic = %topic,
                            partition,
                            offset,
                            failures,
                            backoff_ms = self.redelivery_backoff.as_millis() as u64,
                            "处理 Kafka 消息失败，不保存偏移量，退避后重试"
                        );

                        tokio::select! {
                            biased;

                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    info!(topic = %topic, partition, offset, "收到关闭信号，未完成的消息留待重启后消费");
                                    break 'consume;
                                }
                            }

                            _ = tokio::time::sleep(self.redelivery_backoff) => {}
                        }
                    }

                    if let Err(e) = self.consumer.store_offset(&topic, partition, offset) {
                        warn!(error = %e, topic = %topic, partition, offset, "保存消费偏移量失败");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
