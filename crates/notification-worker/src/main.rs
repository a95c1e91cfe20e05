//! 群消息通知工作者
//!
//! 启动若干 Kafka 消费者和一个过期认领巡检任务，Ctrl-C 后优雅关闭。

use std::sync::Arc;

use anyhow::Result;
use group_notification_worker::{
    DispatchSettings, NotificationDispatcher, SERVICE_NAME, app, consumer::MessageEventConsumer,
    sweeper::ClaimSweeper,
};
use notify_shared::{config::AppConfig, observability};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载并校验配置；配置有误时直接退出，不带着默认值运行
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 初始化日志、追踪与指标
    let _guard = observability::init(&config).await?;

    info!(
        environment = %config.environment,
        storage = %config.storage.backend,
        push = %config.push.provider,
        alerts = %config.alerts.sink,
        "Starting notification-worker..."
    );

    // 3. 装配协作者
    let backends = app::build_backends(&config).await?;
    let dispatcher = Arc::new(NotificationDispatcher::new(
        backends.collaborators.clone(),
        DispatchSettings::from_config(&config.dispatch, &config.push),
    ));

    // 4. 启动消费者与巡检
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let workers = config.dispatch.event_workers.max(1);
    for worker_id in 0..workers {
        let consumer = MessageEventConsumer::new(&config.kafka, dispatcher.clone(), worker_id)?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = consumer.run(shutdown).await {
                error!(worker_id, error = %e, "消息事件消费者异常退出");
            }
        });
    }

    let sweeper = ClaimSweeper::new(
        dispatcher.clone(),
        config.dispatch.sweep_interval(),
        config.dispatch.sweep_batch_size,
    );
    tasks.spawn(sweeper.run(shutdown_rx.clone()));

    info!(workers, "notification-worker 已启动");

    // 5. 等待关闭信号
    signal::ctrl_c().await?;
    info!("收到关闭信号，停止接收新事件");
    let _ = shutdown_tx.send(true);

    // 6. 在宽限期内等待在途任务，超时则强制取消；未完成的认领由租约过期后重投
    let grace = config.dispatch.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "后台任务异常结束");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            grace_secs = grace.as_secs(),
            "在途任务未在宽限期内完成，强制取消"
        );
        tasks.abort_all();
    }

    backends.close().await;
    info!("notification-worker 已停止");
    Ok(())
}
