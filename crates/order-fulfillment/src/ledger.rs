//! 幂等账本
//!
//! 记录已完成履约的订单 ID。记录存在即表示履约事务已提交，
//! 重复投递的消息据此直接确认，不再触碰订单存储。

use std::time::Duration;

use async_trait::async_trait;
use shop_shared::cache::{Cache, CacheKey};
use uuid::Uuid;

use crate::error::Result;

/// 幂等账本接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// 查询订单是否已完成履约
    ///
    /// 查询失败返回错误，调用方不得将其视为“未处理”。
    async fn is_processed(&self, order_id: Uuid) -> Result<bool>;

    /// 标记订单已完成履约，仅在履约事务提交后调用
    async fn mark_processed(&self, order_id: Uuid, ttl: Duration) -> Result<()>;
}

/// 基于 Redis 的幂等账本
///
/// 键为 `order_processed:<order_id>`，值为哨兵 `"1"`，到期自动清除。
#[derive(Clone)]
pub struct RedisLedger {
    cache: Cache,
}

impl RedisLedger {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn is_processed(&self, order_id: Uuid) -> Result<bool> {
        let key = CacheKey::order_processed(&order_id.to_string());
        Ok(self.cache.exists(&key).await?)
    }

    async fn mark_processed(&self, order_id: Uuid, ttl: Duration) -> Result<()> {
        let key = CacheKey::order_processed(&order_id.to_string());
        self.cache.set_raw(&key, "1", ttl).await?;
        Ok(())
    }
}
