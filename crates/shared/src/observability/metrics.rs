//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时（例如单元测试）所有记录函数都是空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 安装 Prometheus recorder 并在指定端口暴露 `/metrics`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notify_events_total",
        "Message events handled by the dispatcher, by outcome"
    );
    metrics::describe_counter!(
        "notify_recipients_total",
        "Recipients processed during fan-out, by outcome"
    );
    metrics::describe_counter!("notify_push_sends_total", "Push sends, by outcome");
    metrics::describe_counter!(
        "notify_tokens_pruned_total",
        "Device tokens removed after permanent rejection"
    );
    metrics::describe_counter!(
        "notify_claims_swept_total",
        "Messages re-driven by the expired claim sweeper"
    );
    metrics::describe_histogram!(
        "notify_dispatch_duration_seconds",
        "Fan-out duration per message in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条消息事件的处理结果（dispatched / dropped / failed / ignored）
#[inline]
pub fn record_event(outcome: &'static str, duration_secs: Option<f64>) {
    metrics::counter!("notify_events_total", "outcome" => outcome).increment(1);
    if let Some(secs) = duration_secs {
        metrics::histogram!("notify_dispatch_duration_seconds").record(secs);
    }
}

/// 记录单个接收者的处理结果
#[inline]
pub fn record_recipient(outcome: &'static str) {
    metrics::counter!("notify_recipients_total", "outcome" => outcome).increment(1);
}

/// 记录一次推送发送（含重试后的最终结果）
#[inline]
pub fn record_push_send(outcome: &'static str) {
    metrics::counter!("notify_push_sends_total", "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_token_pruned() {
    metrics::counter!("notify_tokens_pruned_total").increment(1);
}

#[inline]
pub fn record_claims_swept(messages: usize) {
    metrics::counter!("notify_claims_swept_total").increment(messages as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        record_event("dispatched", Some(0.05));
        record_event("dropped", None);
        record_recipient("sent");
        record_push_send("success");
        record_token_pruned();
        record_claims_swept(3);
        assert!(get_handle().is_none());
    }
}
