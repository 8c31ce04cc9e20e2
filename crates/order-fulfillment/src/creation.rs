//! 订单创建服务
//!
//! 订单事件的源头。写入顺序固定为：订单（含明细）落库 → 发布事件 → 清空购物车，
//! 保证履约方收到事件时订单一定已经以 created 状态存在。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shop_shared::config::KafkaConfig;
use shop_shared::events::OrderEvent;
use shop_shared::kafka::KafkaProducer;
use shop_shared::observability::{metrics, tracing as otel};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cart::CartSource;
use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order};
use crate::store::OrderRepository;

/// 订单事件发布接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderEventPublisher: Send + Sync {
    /// 持久化发布，发布失败同步返回给调用方
    async fn publish(&self, event: &OrderEvent) -> Result<()>;
}

/// 基于 Kafka 的订单事件发布器
///
/// 当前 span 的追踪上下文写入消息 header，履约 span 据此串联到下单链路。
pub struct KafkaOrderPublisher {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaOrderPublisher {
    pub fn new(producer: KafkaProducer, config: &KafkaConfig) -> Self {
        Self {
            producer,
            topic: config.order_topic.clone(),
        }
    }
}

#[async_trait]
impl OrderEventPublisher for KafkaOrderPublisher {
    async fn publish(&self, event: &OrderEvent) -> Result<()> {
        let mut headers = HashMap::new();
        otel::inject_to_headers(&mut headers);
        headers.insert("content-type".to_string(), "application/json".to_string());

        self.producer
            .send_with_headers(&self.topic, &event.message_key(), &event.to_bytes()?, &headers)
            .await?;
        Ok(())
    }
}

/// 订单创建服务
pub struct OrderCreationService {
    orders: Arc<dyn OrderRepository>,
    carts: Arc<dyn CartSource>,
    publisher: Arc<dyn OrderEventPublisher>,
}

impl OrderCreationService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        carts: Arc<dyn CartSource>,
        publisher: Arc<dyn OrderEventPublisher>,
    ) -> Self {
        Self {
            orders,
            carts,
            publisher,
        }
    }

    /// 从用户购物车创建订单
    ///
    /// 事件发布失败时补偿删除刚写入的订单并返回 `PublishFailed`；
    /// 补偿删除也失败时订单保留在 created，由对账任务补发事件。
    /// 购物车清空失败会返回错误，但订单与事件均已生效，不做回退。
    #[instrument(skip(self))]
    pub async fn create_order(&self, user_id: Uuid) -> Result<Order> {
        let lines = self.carts.checkout_lines(user_id).await?;
        if lines.is_empty() {
            return Err(OrderError::EmptyCart(user_id));
        }
        if let Some(line) = lines.iter().find(|line| line.quantity <= 0) {
            return Err(OrderError::InvalidQuantity {
                product_id: line.product_id,
                quantity: line.quantity,
            });
        }

        let new_order = NewOrder::from_lines(user_id, &lines);
        let order = self.orders.create_order(&new_order).await?;

        let event = OrderEvent::new(order.id, user_id);
        if let Err(e) = self.publisher.publish(&event).await {
            metrics::record_publish_failure();
            self.compensate(order.id, &e).await;
            return Err(OrderError::PublishFailed {
                order_id: order.id,
                reason: e.to_string(),
            });
        }

        self.carts.clear(user_id).await?;

        info!(
            order_id = %order.id,
            total_price = %order.total_price,
            items = order.items.len(),
            "订单已创建"
        );
        Ok(order)
    }

    /// 补偿删除发布失败的订单
    async fn compensate(&self, order_id: Uuid, cause: &OrderError) {
        match self.orders.delete_pending_order(order_id).await {
            Ok(true) => warn!(%order_id, error = %cause, "事件发布失败，订单已撤销"),
            Ok(false) => warn!(
                %order_id,
                error = %cause,
                "事件发布失败，订单已不在 created 状态，保持现状"
            ),
            Err(delete_err) => error!(
                %order_id,
                error = %cause,
                delete_error = %delete_err,
                "事件发布失败且撤销订单失败，等待对账任务补发事件"
            ),
        }
    }

    /// 查询订单，只允许订单所属用户访问
    pub async fn get_order(&self, order_id: Uuid, user_id: Uuid) -> Result<Order> {
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;

        if order.user_id != user_id {
            return Err(OrderError::AccessDenied { order_id });
        }
        Ok(order)
    }

    /// 列出用户订单，最新的在前
    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>> {
        self.orders.list_orders_by_user(user_id).await
    }
}
