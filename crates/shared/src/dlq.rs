//! 死信队列处理
//!
//! 处理函数给出 `RejectDrop` 的消息会原样写入死信 topic，并附带诊断 header，
//! 供运维人员排查。死信消息不会被自动重新投递：进入死信队列的都是永久失败
//! （格式错误、订单不存在、库存不足等），自动重试只会重复失败。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SharedError;
use crate::kafka::{ConsumerMessage, HandlerOutcome, KafkaConsumer, KafkaProducer};
use crate::observability::metrics;

/// 诊断 header 名称
pub mod headers {
    pub const REASON: &str = "x-dead-letter-reason";
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";
    pub const ORIGINAL_PARTITION: &str = "x-original-partition";
    pub const ORIGINAL_OFFSET: &str = "x-original-offset";
    pub const DEAD_LETTERED_AT: &str = "x-dead-lettered-at";
}

/// 从失败原因中提取指标标签
///
/// 原因文本约定为 `<kind>: <detail>`，标签只取 kind，避免把订单 ID 等高基数内容写入指标。
pub fn reason_kind(reason: &str) -> &str {
    let kind = reason.split(':').next().unwrap_or_default().trim();
    if kind.is_empty() { "unknown" } else { kind }
}

// ---------------------------------------------------------------------------
// DeadLetter：从 header 还原的死信记录
// ---------------------------------------------------------------------------

/// 死信记录
///
/// 负载保持原样，失败上下文全部来自诊断 header。
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub reason: String,
    pub original_topic: Option<String>,
    pub original_partition: Option<i32>,
    pub original_offset: Option<i64>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

impl DeadLetter {
    /// 解析死信消息，缺失或无法解析的 header 置为 None
    pub fn from_message(msg: &ConsumerMessage) -> Self {
        let h = &msg.headers;
        Self {
            reason: h
                .get(headers::REASON)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            original_topic: h.get(headers::ORIGINAL_TOPIC).cloned(),
            original_partition: h
                .get(headers::ORIGINAL_PARTITION)
                .and_then(|v| v.parse().ok()),
            original_offset: h.get(headers::ORIGINAL_OFFSET).and_then(|v| v.parse().ok()),
            dead_lettered_at: h
                .get(headers::DEAD_LETTERED_AT)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
            payload: msg.payload.clone(),
        }
    }

    /// 以文本形式返回原始负载，非 UTF-8 时做有损转换
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 构造死信消息的 header
///
/// 保留原消息的 header（如 traceparent），再叠加诊断信息。
fn dead_letter_headers(
    msg: &ConsumerMessage,
    reason: &str,
    now: DateTime<Utc>,
) -> HashMap<String, String> {
    let mut out = msg.headers.clone();
    out.insert(headers::REASON.to_string(), reason.to_string());
    out.insert(headers::ORIGINAL_TOPIC.to_string(), msg.topic.clone());
    out.insert(
        headers::ORIGINAL_PARTITION.to_string(),
        msg.partition.to_string(),
    );
    out.insert(headers::ORIGINAL_OFFSET.to_string(), msg.offset.to_string());
    out.insert(headers::DEAD_LETTERED_AT.to_string(), now.to_rfc3339());
    out
}

// ---------------------------------------------------------------------------
// DlqPublisher：将被拒绝的消息写入死信队列
// ---------------------------------------------------------------------------

/// 死信发布器
///
/// 由队列网关在处理函数返回 `RejectDrop` 时调用；发布失败时网关不会提交位点。
pub struct DlqPublisher {
    producer: KafkaProducer,
    topic: String,
}

impl DlqPublisher {
    pub fn new(producer: KafkaProducer, config: &KafkaConfig) -> Self {
        Self {
            producer,
            topic: config.dead_letter_topic.clone(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 将原始负载连同诊断 header 写入死信 topic
    pub async fn publish(&self, msg: &ConsumerMessage, reason: &str) -> Result<(), SharedError> {
        let headers = dead_letter_headers(msg, reason, Utc::now());
        let key = msg.key.as_deref().unwrap_or_default();

        self.producer
            .send_with_headers(&self.topic, key, &msg.payload, &headers)
            .await?;

        metrics::record_dead_lettered(reason_kind(reason));
        warn!(
            source_topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            reason,
            "消息已转入死信队列"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DeadLetterMonitor：观察死信队列
// ---------------------------------------------------------------------------

/// 死信队列监控
///
/// 使用独立消费组订阅死信 topic，逐条输出运维告警日志并计数。
/// 只观察不重发，所有消息处理后立即提交。
pub struct DeadLetterMonitor {
    consumer: KafkaConsumer,
}

impl DeadLetterMonitor {
    pub fn new(config: &KafkaConfig) -> Result<Self, SharedError> {
        let consumer = KafkaConsumer::new(config, Some("dlq-monitor"))?;
        consumer.subscribe(&[config.dead_letter_topic.as_str()])?;

        info!(topic = %config.dead_letter_topic, "死信队列监控已创建");
        Ok(Self { consumer })
    }

    /// 启动监控循环，直到收到关闭信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        self.consumer
            .start(shutdown, None, |msg| async move { observe(&msg) })
            .await;

        info!("死信队列监控已退出");
    }
}

fn observe(msg: &ConsumerMessage) -> HandlerOutcome {
    let letter = DeadLetter::from_message(msg);
    metrics::record_dead_letter_observed(reason_kind(&letter.reason));

    error!(
        reason = %letter.reason,
        original_topic = letter.original_topic.as_deref().unwrap_or("unknown"),
        original_partition = ?letter.original_partition,
        original_offset = ?letter.original_offset,
        dead_lettered_at = ?letter.dead_lettered_at,
        payload = %letter.payload_lossy(),
        "死信消息需人工介入"
    );
    HandlerOutcome::Ack
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
