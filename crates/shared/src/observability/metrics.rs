//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "order_messages_total",
        "Order messages handled, labelled by outcome"
    );
    metrics::describe_histogram!(
        "order_fulfillment_duration_seconds",
        "Fulfillment unit of work duration in seconds"
    );
    metrics::describe_counter!(
        "orders_dead_lettered_total",
        "Messages routed to the dead-letter topic"
    );
    metrics::describe_counter!(
        "dead_letters_observed_total",
        "Dead-letter arrivals seen by the monitor"
    );
    metrics::describe_counter!(
        "idempotency_mark_failures_total",
        "Failed writes to the idempotency ledger after commit"
    );
    metrics::describe_counter!(
        "orders_reconciled_total",
        "Stale created orders whose event was republished"
    );
    metrics::describe_counter!(
        "order_publish_failures_total",
        "Order events that could not be published at creation"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Last successful run of a background worker (unix seconds)"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
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

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条订单消息的处理结果（ack / requeue / dead_letter）
#[inline]
pub fn record_order_message(outcome: &str) {
    metrics::counter!("order_messages_total", "outcome" => outcome.to_string()).increment(1);
}

/// 记录履约事务耗时
#[inline]
pub fn record_fulfillment_duration(result: &str, duration_secs: f64) {
    metrics::histogram!(
        "order_fulfillment_duration_seconds",
        "result" => result.to_string()
    )
    .record(duration_secs);
}

/// 记录转入死信队列的消息
#[inline]
pub fn record_dead_lettered(reason: &str) {
    metrics::counter!("orders_dead_lettered_total", "reason" => reason.to_string()).increment(1);
}

/// 记录死信监控观察到的消息
#[inline]
pub fn record_dead_letter_observed(reason: &str) {
    metrics::counter!("dead_letters_observed_total", "reason" => reason.to_string())
        .increment(1);
}

/// 记录幂等标记写入失败
#[inline]
pub fn record_idempotency_mark_failure() {
    metrics::counter!("idempotency_mark_failures_total").increment(1);
}

/// 记录对账重新发布的订单数
#[inline]
pub fn record_orders_reconciled(count: u64) {
    metrics::counter!("orders_reconciled_total").increment(count);
}

/// 记录订单创建时的事件发布失败
#[inline]
pub fn record_publish_failure() {
    metrics::counter!("order_publish_failures_total").increment(1);
}

/// 更新后台任务最近一次运行时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    metrics::gauge!(
        "worker_last_run_timestamp",
        "worker" => worker.to_string()
    )
    .set(chrono::Utc::now().timestamp() as f64);
}
