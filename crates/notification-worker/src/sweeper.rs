//! 过期认领巡检
//!
//! 工作者在认领后崩溃或遇到存储故障时，记录会停留在 `CLAIMED`。
//! 巡检周期性地找出租约已过期的记录，按消息分组后只对这些接收者重新投递，
//! 不再解析当前会话成员。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify_shared::error::NotifyError;
use notify_shared::events::Message;
use notify_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::NotificationDispatcher;

pub struct ClaimSweeper {
    dispatcher: Arc<NotificationDispatcher>,
    interval: Duration,
    batch_size: usize,
}

impl ClaimSweeper {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, interval: Duration, batch_size: usize) -> Self {
        Self {
            dispatcher,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// 按固定间隔巡检，直到收到 shutdown 信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过它，避免与启动时的消费者抢资源
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "过期认领巡检已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，过期认领巡检退出");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "过期认领巡检失败");
                    }
                }
            }
        }
    }

    /// 执行一轮巡检，返回被重新分发的消息数
    pub async fn sweep_once(&self) -> Result<usize, NotifyError> {
        let expired = self
            .dispatcher
            .ledger()
            .expired_claims(Utc::now(), self.batch_size)
            .await?;

        if expired.is_empty() {
            debug!("没有过期的认领");
            return Ok(0);
        }

        let mut batches: BTreeMap<String, (Message, Vec<String>)> = BTreeMap::new();
        for record in &expired {
            batches
                .entry(record.message_id.clone())
                .or_insert_with(|| (record.message(), Vec::new()))
                .1
                .push(record.recipient_id.clone());
        }

        info!(
            claims = expired.len(),
            messages = batches.len(),
            "重新投递过期认领"
        );

        let mut redriven = 0;
        for (message, recipients) in batches.into_values() {
            let report = self.dispatcher.redeliver(&message, recipients).await;
            if report.errored > 0 {
                warn!(
                    message_id = %message.message_id,
                    errored = report.errored,
                    "部分接收者仍未完成，下轮巡检再试"
                );
            }
            redriven += 1;
        }

        metrics::record_claims_swept(redriven);
        Ok(redriven)
    }
}
