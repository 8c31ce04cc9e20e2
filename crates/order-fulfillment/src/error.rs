//! 订单服务错误类型
//!
//! 定义创建与履约两条路径共用的业务错误和系统错误。
//! 履约 worker 依据 [`OrderError::is_business_failure`] 与 [`OrderError::is_retryable`]
//! 决定消息应标记失败、转入死信队列还是重新投递。

use shop_shared::error::SharedError;
use thiserror::Error;
use uuid::Uuid;

/// 订单服务错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // === 创建订单相关错误 ===
    #[error("购物车为空: user_id={0}")]
    EmptyCart(Uuid),

    #[error("商品数量非法: product_id={product_id}, quantity={quantity}")]
    InvalidQuantity { product_id: Uuid, quantity: i32 },

    #[error("订单不存在: {0}")]
    OrderNotFound(Uuid),

    #[error("无权访问订单: order_id={order_id}")]
    AccessDenied { order_id: Uuid },

    #[error("订单事件发布失败: order_id={order_id}: {reason}")]
    PublishFailed { order_id: Uuid, reason: String },

    // === 履约相关错误 ===
    #[error("库存不足: product_id={product_id}, 需要 {requested}, 可用 {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("商品不存在: {0}")]
    ProductNotFound(Uuid),

    #[error("订单事件格式错误: {0}")]
    MalformedEvent(String),

    // === 系统错误 ===
    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Shared(#[from] SharedError),
}

/// 订单服务 Result 类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 是否为履约业务失败
    ///
    /// 业务失败是订单内容本身无法满足，重试结果不会改变，订单应被标记为 failed。
    pub fn is_business_failure(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock { .. } | Self::ProductNotFound(_) | Self::InvalidQuantity { .. }
        )
    }

    /// 是否为可重试的基础设施错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Timeout(_) | Self::PublishFailed { .. } => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 获取错误码（用于日志与死信原因）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyCart(_) => "empty_cart",
            Self::InvalidQuantity { .. } => "invalid_quantity",
            Self::OrderNotFound(_) => "order_not_found",
            Self::AccessDenied { .. } => "access_denied",
            Self::PublishFailed { .. } => "publish_failed",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::ProductNotFound(_) => "product_not_found",
            Self::MalformedEvent(_) => "malformed_event",
            Self::Timeout(_) => "timeout",
            Self::Database(_) => "database_error",
            Self::Shared(e) => e.code(),
        }
    }

    /// 死信原因文本，格式为 `<code>: <detail>`
    pub fn dead_letter_reason(&self) -> String {
        format!("{}: {}", self.error_code(), self)
    }
}
