//! 订单履约 Worker
//!
//! 消费 Kafka 订单事件完成履约，同时运行滞留订单对账与死信队列监控。

use std::sync::Arc;

use order_fulfillment::creation::KafkaOrderPublisher;
use order_fulfillment::ledger::RedisLedger;
use order_fulfillment::reconciler::OrderReconciler;
use order_fulfillment::store::{PgOrderStore, TransactionLimits};
use order_fulfillment::worker::{OrderFulfillmentWorker, WorkerSettings};
use shop_shared::{
    cache::Cache,
    config::AppConfig,
    database::Database,
    dlq::{DeadLetterMonitor, DlqPublisher},
    kafka::{KafkaConsumer, KafkaProducer, declare_order_topology},
    observability,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "order-fulfillment-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        order_topic = %config.kafka.order_topic,
        "Starting {}...",
        config.service_name
    );

    // 依赖不可用时直接退出，由编排系统重启
    let db = Database::connect(&config.database).await?;
    db.health_check().await?;
    db.run_migrations().await?;

    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;

    declare_order_topology(&config.kafka).await?;

    let producer = KafkaProducer::new(&config.kafka)?;
    let store = Arc::new(PgOrderStore::new(
        db.pool().clone(),
        TransactionLimits::from(&config.fulfillment),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // 履约 Worker
    let worker = OrderFulfillmentWorker::new(
        store.clone(),
        Arc::new(RedisLedger::new(cache)),
        WorkerSettings::from(&config.fulfillment),
    );
    let consumer = KafkaConsumer::new(&config.kafka, None)?;
    consumer.subscribe(&[config.kafka.order_topic.as_str()])?;
    let dead_letters = DlqPublisher::new(producer.clone(), &config.kafka);
    let rx = shutdown_rx.clone();
    tasks.spawn(async move {
        worker.run(consumer, &dead_letters, rx).await;
    });

    // 滞留订单对账
    if config.reconciliation.enabled {
        let reconciler = OrderReconciler::new(
            store.clone(),
            Arc::new(KafkaOrderPublisher::new(producer.clone(), &config.kafka)),
            &config.reconciliation,
        );
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            reconciler.run(rx).await;
        });
    }

    // 死信队列监控
    if config.fulfillment.dead_letter_monitor_enabled {
        let monitor = DeadLetterMonitor::new(&config.kafka)?;
        tasks.spawn(monitor.run(shutdown_rx.clone()));
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // 等待在途消息处理完毕，超过宽限期则强制退出
    let grace = config.fulfillment.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "后台任务异常退出");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(?grace, "宽限期内后台任务未全部退出，强制终止");
        tasks.abort_all();
    }

    db.close().await;
    info!("Shutdown complete");

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
