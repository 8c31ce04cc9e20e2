//! Redis 缓存管理模块
//!
//! 提供 Redis 连接管理和幂等账本所需的键值操作封装。

use crate::config::RedisConfig;
use crate::error::{Result, SharedError};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{info, instrument};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct Cache {
    client: Client,
}

impl Cache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(SharedError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    /// 检查键是否存在
    #[instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    /// 写入原始字符串值并指定 TTL（SET key value EX ttl）
    #[instrument(skip(self, value))]
    pub async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        // SET EX 只接受正整数秒
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    /// 删除值
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// 剩余存活时间（秒），键不存在或未设置过期时返回 None
    pub async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.get_conn().await?;
        let ttl: i64 = conn.ttl(key).await?;
        Ok((ttl >= 0).then_some(ttl))
    }
}

/// 缓存键生成器
pub struct CacheKey;

impl CacheKey {
    /// 订单已履约标记
    pub fn order_processed(order_id: &str) -> String {
        format!("order_processed:{}", order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_generation() {
        assert_eq!(
            CacheKey::order_processed("3f1c9a52-0000-4000-8000-000000000001"),
            "order_processed:3f1c9a52-0000-4000-8000-000000000001"
        );
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 连接
    async fn test_set_raw_and_exists() {
        let cache = Cache::new(&crate::test_utils::test_redis_config()).unwrap();
        let key = format!("test:{}", uuid::Uuid::new_v4());

        assert!(!cache.exists(&key).await.unwrap());
        cache.set_raw(&key, "1", Duration::from_secs(60)).await.unwrap();
        assert!(cache.exists(&key).await.unwrap());
        assert!(cache.ttl(&key).await.unwrap().is_some());

        cache.delete(&key).await.unwrap();
        assert!(!cache.exists(&key).await.unwrap());
    }
}
