//! 订单对账任务
//!
//! 定期扫描长时间停留在 created 状态的订单并补发事件。
//! 这类订单来自“事件发布失败且补偿删除也失败”的创建请求；
//! 履约是幂等的，即使原事件其实已送达，补发也不会造成重复扣减。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shop_shared::config::ReconciliationConfig;
use shop_shared::error::SharedError;
use shop_shared::events::OrderEvent;
use shop_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::creation::OrderEventPublisher;
use crate::error::Result;
use crate::store::OrderRepository;

/// 对账任务
pub struct OrderReconciler {
    orders: Arc<dyn OrderRepository>,
    publisher: Arc<dyn OrderEventPublisher>,
    interval: Duration,
    stale_after: Duration,
    batch_size: i64,
}

impl OrderReconciler {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        publisher: Arc<dyn OrderEventPublisher>,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            orders,
            publisher,
            interval: config.interval(),
            stale_after: config.stale_after(),
            batch_size: config.batch_size,
        }
    }

    /// 主循环：按固定间隔执行扫描，直到收到关闭信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            stale_after = ?self.stale_after,
            batch_size = self.batch_size,
            "OrderReconciler 已启动"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "订单对账出错");
                    }
                    metrics::set_worker_last_run("order_reconciler");
                }
            }
        }

        info!("OrderReconciler 已退出");
    }

    /// 执行一轮扫描，返回补发成功的订单数
    ///
    /// 某条补发失败时本轮立即结束，broker 不可用时不必逐条等待超时。
    pub async fn sweep(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| SharedError::Internal(format!("stale_after 超出范围: {e}")))?;
        let cutoff = Utc::now() - stale_after;

        let stale = self
            .orders
            .stale_created_orders(cutoff, self.batch_size)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!(count = stale.len(), "发现滞留的 created 订单，准备补发事件");

        let mut republished = 0;
        for order in &stale {
            let event = OrderEvent::new(order.id, order.user_id);
            match self.publisher.publish(&event).await {
                Ok(()) => republished += 1,
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "补发订单事件失败，本轮对账结束");
                    break;
                }
            }
        }

        metrics::record_orders_reconciled(republished as u64);
        info!(republished, total = stale.len(), "订单对账完成");
        Ok(republished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::MockOrderEventPublisher;
    use crate::models::{Order, OrderStatus};
    use crate::store::MockOrderRepository;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn stale_order() -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: OrderStatus::Created,
            total_price: Decimal::new(500, 2),
            items: vec![],
            created_at: Utc::now() - chrono::Duration::hours(1),
            updated_at: Utc::now() - chrono::Duration::hours(1),
        }
    }

    fn config() -> ReconciliationConfig {
        ReconciliationConfig {
            batch_size: 10,
            stale_after_seconds: 300,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_republishes_stale_orders() {
        let stale = vec![stale_order(), stale_order()];
        let expected: Vec<Uuid> = stale.iter().map(|o| o.id).collect();

        let mut orders = MockOrderRepository::new();
        orders
            .expect_stale_created_orders()
            .withf(|cutoff, limit| *limit == 10 && *cutoff < Utc::now() - chrono::Duration::seconds(299))
            .times(1)
            .returning(move |_, _| Ok(stale.clone()));

        let mut publisher = MockOrderEventPublisher::new();
        publisher
            .expect_publish()
            .withf(move |e| expected.contains(&e.order_id))
            .times(2)
            .returning(|_| Ok(()));

        let reconciler = OrderReconciler::new(Arc::new(orders), Arc::new(publisher), &config());
        assert_eq!(reconciler.sweep().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_stops_at_first_publish_failure() {
        let stale = vec![stale_order(), stale_order(), stale_order()];

        let mut orders = MockOrderRepository::new();
        orders
            .expect_stale_created_orders()
            .returning(move |_, _| Ok(stale.clone()));

        let mut publisher = MockOrderEventPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_| Err(SharedError::Kafka("broker down".into()).into()));

        let reconciler = OrderReconciler::new(Arc::new(orders), Arc::new(publisher), &config());
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let mut orders = MockOrderRepository::new();
        orders
            .expect_stale_created_orders()
            .returning(|_, _| Ok(vec![]));

        let reconciler = OrderReconciler::new(
            Arc::new(orders),
            Arc::new(MockOrderEventPublisher::new()),
            &config(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_still_ticks_and_stops() {
        let mut orders = MockOrderRepository::new();
        orders
            .expect_stale_created_orders()
            .times(1..)
            .returning(|_, _| Ok(vec![]));

        let reconciler = OrderReconciler::new(
            Arc::new(orders),
            Arc::new(MockOrderEventPublisher::new()),
            &ReconciliationConfig {
                interval_seconds: 0,
                ..config()
            },
        );
        assert_eq!(reconciler.interval, Duration::from_secs(1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        // 首个 tick 立即触发
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler should stop")
            .unwrap();
    }
}
