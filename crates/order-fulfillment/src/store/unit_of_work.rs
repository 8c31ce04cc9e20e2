//! 事务单元
//!
//! 包装一个 Postgres 事务，显式传递给每个存储步骤。
//! `commit` 与 `rollback` 消费自身，保证每个事务恰好结束一次；
//! 未显式结束就被 drop 的事务由 sqlx 自动回滚。

use std::time::Duration;

use shop_shared::config::FulfillmentConfig;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::error::Result;

/// 事务内的语句与锁等待上限
#[derive(Debug, Clone, Copy)]
pub struct TransactionLimits {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
}

impl From<&FulfillmentConfig> for TransactionLimits {
    fn from(config: &FulfillmentConfig) -> Self {
        Self {
            statement_timeout: Duration::from_millis(config.statement_timeout_ms),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        }
    }
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self::from(&FulfillmentConfig::default())
    }
}

impl TransactionLimits {
    /// 生成 SET LOCAL 语句，仅在当前事务内生效
    fn statements(&self) -> [String; 2] {
        [
            format!(
                "SET LOCAL statement_timeout = {}",
                self.statement_timeout.as_millis()
            ),
            format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis()),
        ]
    }
}

/// 事务单元
pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork {
    /// 开启事务并应用超时限制
    pub async fn begin(pool: &PgPool, limits: &TransactionLimits) -> Result<Self> {
        let mut tx = pool.begin().await?;
        for statement in limits.statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        Ok(Self { tx })
    }

    /// 事务内的连接，供 `*_in_tx` 步骤使用
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_render_as_milliseconds() {
        let limits = TransactionLimits {
            statement_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_millis(750),
        };
        let [statement, lock] = limits.statements();
        assert_eq!(statement, "SET LOCAL statement_timeout = 2000");
        assert_eq!(lock, "SET LOCAL lock_timeout = 750");
    }

    #[test]
    fn test_limits_from_config() {
        let limits = TransactionLimits::from(&FulfillmentConfig {
            statement_timeout_ms: 1234,
            lock_timeout_ms: 56,
            ..Default::default()
        });
        assert_eq!(limits.statement_timeout, Duration::from_millis(1234));
        assert_eq!(limits.lock_timeout, Duration::from_millis(56));
    }
}
