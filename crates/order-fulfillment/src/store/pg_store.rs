//! Postgres 订单存储
//!
//! 履约事务严格依赖两个带条件的更新：
//! - 状态守卫 `WHERE status = 'created'` 获取订单行锁，并发事务中的后到者看到的已不是 created
//! - 库存守卫 `WHERE stock >= $2`，库存永远不会被扣成负数

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::unit_of_work::{TransactionLimits, UnitOfWork};
use super::{FulfillmentOutcome, OrderRepository, OrderStore};
use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order, OrderItem, OrderStatus};

/// Postgres 订单存储
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
    limits: TransactionLimits,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, limits: TransactionLimits) -> Self {
        Self { pool, limits }
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, total_price, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut order) = order else {
            return Ok(None);
        };
        order.items = self.load_items(order_id).await?;
        Ok(Some(order))
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, quantity, price
            FROM order_items
            WHERE order_id = $1
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // ==================== 事务操作 ====================

    /// 在事务中认领订单：created → processing
    ///
    /// 返回 false 表示订单已不在 created 状态。
    pub async fn claim_in_tx(tx: &mut PgConnection, order_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status = 'created'
            "#,
        )
        .bind(order_id)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 在事务中按明细扣减库存
    ///
    /// 未扣减时再查一次库存，区分商品不存在与库存不足。
    pub async fn decrement_stock_in_tx(tx: &mut PgConnection, item: &OrderItem) -> Result<()> {
        if item.quantity <= 0 {
            return Err(OrderError::InvalidQuantity {
                product_id: item.product_id,
                quantity: item.quantity,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock = stock - $2, updated_at = NOW()
            WHERE id = $1 AND stock >= $2
            "#,
        )
        .bind(item.product_id)
        .bind(item.quantity)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let available: Option<i32> = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
            .bind(item.product_id)
            .fetch_optional(&mut *tx)
            .await?;

        match available {
            None => Err(OrderError::ProductNotFound(item.product_id)),
            Some(available) => Err(OrderError::InsufficientStock {
                product_id: item.product_id,
                requested: item.quantity,
                available,
            }),
        }
    }

    /// 在事务中完成订单：processing → completed
    pub async fn complete_in_tx(tx: &mut PgConnection, order_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(order_id)
        .execute(tx)
        .await?;

        if result.rows_affected() != 1 {
            // 本事务持有订单行锁，走到这里说明数据被外部改动
            return Err(OrderError::Shared(shop_shared::error::SharedError::Internal(
                format!("订单 {order_id} 不在 processing 状态，无法完成"),
            )));
        }
        Ok(())
    }

    /// 事务内的全部履约步骤，提交或回滚由调用方决定
    async fn apply_fulfillment(uow: &mut UnitOfWork, order: &Order) -> Result<FulfillmentOutcome> {
        if !Self::claim_in_tx(uow.conn(), order.id).await? {
            return Ok(FulfillmentOutcome::AlreadyHandled);
        }

        // 明细已在下单时写入，这里无需再持久化

        // 按商品 ID 顺序加锁，避免并发订单交叉锁定同一批商品
        let mut items: Vec<&OrderItem> = order.items.iter().collect();
        items.sort_by_key(|item| item.product_id);

        for item in items {
            Self::decrement_stock_in_tx(uow.conn(), item).await?;
        }

        Self::complete_in_tx(uow.conn(), order.id).await?;
        Ok(FulfillmentOutcome::Completed)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.load_order(order_id).await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, items = order.items.len()))]
    async fn fulfill(&self, order: &Order) -> Result<FulfillmentOutcome> {
        let mut uow = UnitOfWork::begin(&self.pool, &self.limits).await?;

        match Self::apply_fulfillment(&mut uow, order).await {
            Ok(FulfillmentOutcome::Completed) => {
                uow.commit().await?;
                debug!("履约事务已提交");
                Ok(FulfillmentOutcome::Completed)
            }
            Ok(FulfillmentOutcome::AlreadyHandled) => {
                uow.rollback().await?;
                debug!("订单已被处理，事务已回滚");
                Ok(FulfillmentOutcome::AlreadyHandled)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "履约事务回滚失败，连接关闭时由数据库回滚");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, order_id: Uuid) -> Result<bool> {
        let mut uow = UnitOfWork::begin(&self.pool, &self.limits).await?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'created'
            "#,
        )
        .bind(order_id)
        .execute(uow.conn())
        .await?;

        uow.commit().await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OrderRepository for PgOrderStore {
    #[instrument(skip(self, order), fields(order_id = %order.id, user_id = %order.user_id))]
    async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        let mut uow = UnitOfWork::begin(&self.pool, &self.limits).await?;

        let mut created = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (id, user_id, status, total_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING id, user_id, status, total_price, created_at, updated_at
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(OrderStatus::Created)
        .bind(order.total_price)
        .fetch_one(uow.conn())
        .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, quantity, price, created_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(item.id)
            .bind(item.order_id)
            .bind(item.product_id)
            .bind(item.quantity)
            .bind(item.price)
            .execute(uow.conn())
            .await?;
        }

        uow.commit().await?;

        created.items = order.items.clone();
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_pending_order(&self, order_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1 AND status = 'created'")
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.load_order(order_id).await
    }

    async fn list_orders_by_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, total_price, created_at, updated_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn stale_created_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, total_price, created_at, updated_at
            FROM orders
            WHERE status = 'created' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}
