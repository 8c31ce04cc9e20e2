//! 共享库
//!
//! 订单系统各进程共用的基础设施：配置、错误处理、数据库连接、Redis、Kafka 队列网关、
//! 死信队列与可观测性。

pub mod cache;
pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod test_utils;
