//! 订单存储
//!
//! 定义存储接口，worker 与创建服务依赖抽象而非具体实现，支持 mock 测试。
//! [`PgOrderStore`] 同时实现两个接口。

mod pg_store;
mod unit_of_work;

pub use pg_store::PgOrderStore;
pub use unit_of_work::{TransactionLimits, UnitOfWork};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewOrder, Order};

/// 履约事务的结果
///
/// 业务失败（库存不足等）不在此列，以错误形式返回。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    /// 库存已扣减，订单已完成
    Completed,
    /// 订单已不在 created 状态（被其他实例处理或已终结），事务已回滚
    AlreadyHandled,
}

/// 履约侧存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 读取订单及其明细，不存在时返回 None
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// 在单个事务内完成履约：created → processing，逐项扣减库存，processing → completed
    ///
    /// 任何一步失败都会整体回滚，订单保持 created。
    async fn fulfill(&self, order: &Order) -> Result<FulfillmentOutcome>;

    /// 在独立的短事务中将 created 订单标记为 failed
    ///
    /// 返回是否实际发生了状态变更。
    async fn mark_failed(&self, order_id: Uuid) -> Result<bool>;
}

/// 创建侧存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 在同一事务中写入订单（created）及全部明细
    async fn create_order(&self, order: &NewOrder) -> Result<Order>;

    /// 补偿删除仍处于 created 的订单，明细级联删除
    async fn delete_pending_order(&self, order_id: Uuid) -> Result<bool>;

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// 按创建时间倒序列出用户订单
    async fn list_orders_by_user(&self, user_id: Uuid) -> Result<Vec<Order>>;

    /// 列出早于 `created_before` 且仍处于 created 的订单，最早的优先
    async fn stale_created_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>>;
}
