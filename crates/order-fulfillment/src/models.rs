//! 订单领域模型
//!
//! 所有模型都支持数据库（sqlx）和 JSON（serde）序列化

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// 订单状态
///
/// 状态流转：created → processing → completed | failed。
/// processing 只存在于履约事务内部，事务提交时一定已经流转到终态。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum OrderStatus {
    /// 已创建，等待履约
    #[default]
    Created,
    /// 履约中
    Processing,
    /// 履约完成，库存已扣减
    Completed,
    /// 履约失败（库存不足、商品不存在等）
    Failed,
}

impl OrderStatus {
    /// 是否为终态，终态没有后续流转
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub total_price: Decimal,
    #[sqlx(skip)]
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 订单明细
///
/// 单价是下单时刻的快照，创建后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

impl OrderItem {
    pub fn subtotal(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// 购物车结算行：商品、数量和当前单价
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// 待持久化的新订单
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total_price: Decimal,
    pub items: Vec<OrderItem>,
}

impl NewOrder {
    /// 根据结算行构造订单，总价为各行单价乘数量之和
    pub fn from_lines(user_id: Uuid, lines: &[CheckoutLine]) -> Self {
        let id = Uuid::now_v7();
        let items: Vec<OrderItem> = lines
            .iter()
            .map(|line| OrderItem {
                id: Uuid::now_v7(),
                order_id: id,
                product_id: line.product_id,
                quantity: line.quantity,
                price: line.unit_price,
            })
            .collect();
        let total_price = items.iter().map(OrderItem::subtotal).sum();

        Self {
            id,
            user_id,
            total_price,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Created.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(OrderStatus::Completed.to_string(), "completed");
        assert_eq!(OrderStatus::default(), OrderStatus::Created);
    }

    #[test]
    fn test_new_order_total_is_exact() {
        let user_id = Uuid::new_v4();
        let lines = vec![
            CheckoutLine {
                product_id: Uuid::new_v4(),
                quantity: 3,
                unit_price: Decimal::new(1999, 2),
            },
            CheckoutLine {
                product_id: Uuid::new_v4(),
                quantity: 1,
                unit_price: Decimal::new(10, 1),
            },
        ];

        let order = NewOrder::from_lines(user_id, &lines);

        // 3 × 19.99 + 1 × 1.0 = 60.97
        assert_eq!(order.total_price, Decimal::new(6097, 2));
        assert_eq!(order.items.len(), 2);
        assert!(order.items.iter().all(|item| item.order_id == order.id));
        assert_eq!(order.items[0].price, Decimal::new(1999, 2));
    }
}
