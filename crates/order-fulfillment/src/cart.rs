//! 购物车数据源
//!
//! 创建订单只需要读取结算行和清空购物车，购物车的增删改由外部服务负责。

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::models::CheckoutLine;

/// 购物车数据源接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartSource: Send + Sync {
    /// 读取用户购物车的结算行（商品、数量、当前单价）
    async fn checkout_lines(&self, user_id: Uuid) -> Result<Vec<CheckoutLine>>;

    /// 清空用户购物车
    async fn clear(&self, user_id: Uuid) -> Result<()>;
}

#[derive(FromRow)]
struct CartLineRow {
    product_id: Uuid,
    quantity: i32,
    unit_price: Option<Decimal>,
}

/// Postgres 购物车数据源
pub struct PgCartSource {
    pool: PgPool,
}

impl PgCartSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CartSource for PgCartSource {
    #[instrument(skip(self))]
    async fn checkout_lines(&self, user_id: Uuid) -> Result<Vec<CheckoutLine>> {
        let rows = sqlx::query_as::<_, CartLineRow>(
            r#"
            SELECT ci.product_id, ci.quantity, p.price AS unit_price
            FROM carts c
            JOIN cart_items ci ON ci.cart_id = c.id
            LEFT JOIN products p ON p.id = ci.product_id
            WHERE c.user_id = $1
            ORDER BY ci.created_at, ci.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let unit_price = row
                    .unit_price
                    .ok_or(OrderError::ProductNotFound(row.product_id))?;
                Ok(CheckoutLine {
                    product_id: row.product_id,
                    quantity: row.quantity,
                    unit_price,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn clear(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM cart_items
            WHERE cart_id IN (SELECT id FROM carts WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
