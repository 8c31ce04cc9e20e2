//! 订单履约服务
//!
//! 消费订单创建事件，以恰好一次的效果完成库存扣减与订单终态流转；
//! 同时提供事件的生产方（订单创建）与滞留订单的对账补发。

pub mod cart;
pub mod creation;
pub mod error;
pub mod ledger;
pub mod models;
pub mod reconciler;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use error::{OrderError, Result};
