//! 统一可观测性模块
//!
//! 提供 metrics、tracing、logging 的统一初始化。
//! 服务通过单一入口点配置可观测性，确保一致的指标命名和追踪传播。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::AppConfig;

/// 可观测性资源守卫
///
/// 持有各可观测性资源的生命周期，drop 时关闭追踪 provider 并刷新待发送 span。
pub struct ObservabilityGuard {
    _metrics_handle: Option<metrics::MetricsHandle>,
    _tracing_guard: tracing::TracingGuard,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 先初始化日志与追踪，再按配置启动 Prometheus 指标端点。
///
/// # Example
///
/// ```ignore
/// let config = AppConfig::load("notification-worker")?;
/// let _guard = notify_shared::observability::init(&config).await?;
/// ```
pub async fn init(config: &AppConfig) -> Result<ObservabilityGuard> {
    let tracing_guard = tracing::init(&config.service_name, &config.observability)?;

    info!(
        service = %config.service_name,
        metrics_enabled = config.observability.metrics_enabled,
        metrics_port = config.observability.metrics_port,
        otlp_endpoint = ?config.observability.otlp_endpoint,
        "Observability initialized"
    );

    let metrics_handle = if config.observability.metrics_enabled {
        Some(metrics::init(&config.service_name, config.observability.metrics_port).await?)
    } else {
        None
    };

    Ok(ObservabilityGuard {
        _metrics_handle: metrics_handle,
        _tracing_guard: tracing_guard,
    })
}
