//! 订单履约 Worker
//!
//! 消费订单创建事件，经幂等检查后驱动订单存储完成履约事务，
//! 最终给出 [`HandlerOutcome`] 交由队列网关确认、回退或转入死信队列。
//!
//! 决策规则：
//! - 内容错误（格式错误、订单不存在）→ 死信
//! - 基础设施错误（Redis/Postgres 不可用、事务超时）→ 重新投递，订单由回滚保持 created
//! - 业务失败（库存不足、商品不存在、数量非法）→ 标记 failed 后转入死信

use std::sync::Arc;
use std::time::{Duration, Instant};

use shop_shared::config::FulfillmentConfig;
use shop_shared::dlq::DlqPublisher;
use shop_shared::events::OrderEvent;
use shop_shared::kafka::{ConsumerMessage, HandlerOutcome, KafkaConsumer};
use shop_shared::observability::{metrics, tracing as otel};
use tokio::sync::watch;
use tracing::{Instrument, error, field, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::ledger::IdempotencyLedger;
use crate::models::{Order, OrderStatus};
use crate::store::{FulfillmentOutcome, OrderStore};

/// Worker 运行参数
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub idempotency_ttl: Duration,
    pub transaction_timeout: Duration,
}

impl From<&FulfillmentConfig> for WorkerSettings {
    fn from(config: &FulfillmentConfig) -> Self {
        Self {
            idempotency_ttl: config.idempotency_ttl(),
            transaction_timeout: config.transaction_timeout(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&FulfillmentConfig::default())
    }
}

/// 订单履约 Worker
pub struct OrderFulfillmentWorker {
    store: Arc<dyn OrderStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    settings: WorkerSettings,
}

impl OrderFulfillmentWorker {
    pub fn new(
        store: Arc<dyn OrderStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            settings,
        }
    }

    /// 启动消费循环，直到收到关闭信号
    ///
    /// 在途消息总能处理完毕（提交或回滚）后才退出。
    pub async fn run(
        &self,
        consumer: KafkaConsumer,
        dead_letters: &DlqPublisher,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(
            transaction_timeout = ?self.settings.transaction_timeout,
            idempotency_ttl = ?self.settings.idempotency_ttl,
            "订单履约 Worker 已启动"
        );

        consumer
            .start(shutdown, Some(dead_letters), |msg| async move {
                self.handle_message(&msg).await
            })
            .await;

        info!("订单履约 Worker 已退出");
    }

    /// 处理一条 Kafka 消息
    ///
    /// 以消息 header 中的追踪上下文作为父 span，并按结果计数。
    pub async fn handle_message(&self, msg: &ConsumerMessage) -> HandlerOutcome {
        let span = tracing::info_span!(
            "fulfill_order",
            partition = msg.partition,
            offset = msg.offset,
            order_id = field::Empty,
            outcome = field::Empty,
        );
        otel::set_parent_from_headers(&span, &msg.headers);

        let outcome = self.handle(&msg.payload).instrument(span.clone()).await;

        span.record("outcome", outcome.label());
        metrics::record_order_message(outcome.label());
        outcome
    }

    /// 处理消息体，返回确认决策
    pub async fn handle(&self, payload: &[u8]) -> HandlerOutcome {
        let event = match OrderEvent::from_bytes(payload) {
            Ok(event) => event,
            Err(e) => {
                let err = OrderError::MalformedEvent(e.to_string());
                error!(error = %err, "订单事件无法解析，转入死信队列");
                return HandlerOutcome::drop_to_dlq(err.dead_letter_reason());
            }
        };

        tracing::Span::current().record("order_id", field::display(event.order_id));
        self.process(event).await
    }

    async fn process(&self, event: OrderEvent) -> HandlerOutcome {
        let order_id = event.order_id;

        match self.ledger.is_processed(order_id).await {
            Ok(true) => {
                info!(%order_id, "订单已履约，跳过重复消息");
                return HandlerOutcome::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%order_id, error = %e, "幂等检查失败，消息将重新投递");
                return HandlerOutcome::requeue(format!("idempotency_check: {e}"));
            }
        }

        let order = match self.store.get_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                let err = OrderError::OrderNotFound(order_id);
                error!(%order_id, user_id = %event.user_id, "订单不存在，转入死信队列");
                return HandlerOutcome::drop_to_dlq(err.dead_letter_reason());
            }
            Err(e) => {
                warn!(%order_id, error = %e, "读取订单失败，消息将重新投递");
                return HandlerOutcome::requeue(format!("order_load: {e}"));
            }
        };

        if order.status.is_terminal() {
            info!(%order_id, status = %order.status, "订单已处于终态，无需处理");
            // 只有 completed 才代表履约事务已提交
            if order.status == OrderStatus::Completed {
                self.mark_processed(order_id).await;
            }
            return HandlerOutcome::Ack;
        }

        self.fulfill(&order).await
    }

    async fn fulfill(&self, order: &Order) -> HandlerOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.settings.transaction_timeout,
            self.store.fulfill(order),
        )
        .await
        .unwrap_or_else(|_| {
            Err(OrderError::Timeout(format!(
                "履约事务超过 {:?}",
                self.settings.transaction_timeout
            )))
        });

        let result_label = match &result {
            Ok(FulfillmentOutcome::Completed) => "completed",
            Ok(FulfillmentOutcome::AlreadyHandled) => "already_handled",
            Err(e) if e.is_business_failure() => "business_failure",
            Err(_) => "infrastructure_error",
        };
        metrics::record_fulfillment_duration(result_label, started.elapsed().as_secs_f64());

        match result {
            Ok(FulfillmentOutcome::Completed) => {
                info!(
                    order_id = %order.id,
                    items = order.items.len(),
                    total_price = %order.total_price,
                    "订单履约完成"
                );
                self.mark_processed(order.id).await;
                HandlerOutcome::Ack
            }
            Ok(FulfillmentOutcome::AlreadyHandled) => {
                info!(order_id = %order.id, "订单已被其他实例处理");
                self.mark_if_completed(order.id).await;
                HandlerOutcome::Ack
            }
            Err(e) if e.is_business_failure() => self.fail_order(order.id, e).await,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "履约事务失败，消息将重新投递");
                HandlerOutcome::requeue(format!("{}: {e}", e.error_code()))
            }
        }
    }

    /// 业务失败：在独立短事务中标记订单 failed，再转入死信队列
    ///
    /// 标记本身失败时订单仍为 created，重新投递可再次完整处理。
    async fn fail_order(&self, order_id: Uuid, cause: OrderError) -> HandlerOutcome {
        match self.store.mark_failed(order_id).await {
            Ok(changed) => {
                error!(%order_id, error = %cause, changed, "订单履约失败，已标记 failed");
                HandlerOutcome::drop_to_dlq(cause.dead_letter_reason())
            }
            Err(e) => {
                warn!(
                    %order_id,
                    error = %e,
                    cause = %cause,
                    "标记订单 failed 失败，消息将重新投递"
                );
                HandlerOutcome::requeue(format!("mark_failed: {e}"))
            }
        }
    }

    /// 状态守卫未命中时重新读取订单，仅在已 completed 时写入幂等记录
    ///
    /// 其他实例可能已将订单标记为 failed，此时不能留下已履约记录。
    async fn mark_if_completed(&self, order_id: Uuid) {
        match self.store.get_order(order_id).await {
            Ok(Some(order)) if order.status == OrderStatus::Completed => {
                self.mark_processed(order_id).await;
            }
            Ok(Some(order)) => {
                info!(%order_id, status = %order.status, "订单未完成履约，不写入幂等记录");
            }
            Ok(None) => {
                warn!(%order_id, "重新读取时订单不存在，不写入幂等记录");
            }
            Err(e) => {
                warn!(%order_id, error = %e, "重新读取订单失败，不写入幂等记录");
            }
        }
    }

    /// 尽力写入幂等记录，失败只记录日志：订单状态守卫会兜住重复投递
    async fn mark_processed(&self, order_id: Uuid) {
        if let Err(e) = self
            .ledger
            .mark_processed(order_id, self.settings.idempotency_ttl)
            .await
        {
            metrics::record_idempotency_mark_failure();
            warn!(%order_id, error = %e, "写入幂等记录失败");
        }
    }
}
