//! 订单事件模型
//!
//! 订单创建成功后发布到主队列的消息。事件只携带标识，不携带订单内容：
//! 履约方始终从订单存储重新读取状态，事件仅作为触发器。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SharedError};

/// 订单已创建事件
///
/// 线上格式为 `{"order_id": "<uuid>", "user_id": "<uuid>"}`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub user_id: Uuid,
}

impl OrderEvent {
    pub fn new(order_id: Uuid, user_id: Uuid) -> Self {
        Self { order_id, user_id }
    }

    /// 消息 key 使用订单 ID，同一订单的重复投递落在同一分区
    pub fn message_key(&self) -> String {
        self.order_id.to_string()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(SharedError::from)
    }

    /// 解析消息体，格式问题一律视为内容错误
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(SharedError::from)
    }
}
