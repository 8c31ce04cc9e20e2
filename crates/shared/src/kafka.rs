//! Kafka 基础设施封装（队列网关）
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象：
//! - 声明订单主队列与死信队列拓扑
//! - 持久化投递（acks=all + 幂等生产者）
//! - 手动确认：处理函数返回 [`HandlerOutcome`]，由网关负责提交位点、回退重投或转入死信队列
//! - 基于 `watch` channel 的优雅关闭，在途消息处理完毕后才退出

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Offset;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::dlq::DlqPublisher;
use crate::error::SharedError;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str, SharedError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| SharedError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, SharedError> {
        serde_json::from_slice(&self.payload).map_err(SharedError::from)
    }
}

// ---------------------------------------------------------------------------
// HandlerOutcome：处理函数的确认决策
// ---------------------------------------------------------------------------

/// 消息处理结果
///
/// 处理函数只负责给出决策，不直接操作位点：
/// - `Ack`：处理成功（或确认是重复投递），提交位点
/// - `RejectRequeue`：基础设施暂时不可用，不提交位点并回退，由 broker 重新投递
/// - `RejectDrop`：内容或业务上的永久失败，原样转入死信队列后提交位点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    RejectRequeue { reason: String },
    RejectDrop { reason: String },
}

impl HandlerOutcome {
    pub fn requeue(reason: impl Into<String>) -> Self {
        Self::RejectRequeue {
            reason: reason.into(),
        }
    }

    pub fn drop_to_dlq(reason: impl Into<String>) -> Self {
        Self::RejectDrop {
            reason: reason.into(),
        }
    }

    /// 指标与日志使用的短标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::RejectRequeue { .. } => "requeue",
            Self::RejectDrop { .. } => "dead_letter",
        }
    }
}

/// 网关对单条消息的落地动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Commit,
    DeadLetterThenCommit,
    Seek,
}

/// 根据处理结果决定位点操作
///
/// 未配置死信路由时，永久失败的消息只能记录日志后提交，否则会无限重投。
fn plan_settlement(outcome: &HandlerOutcome, has_dead_letter_route: bool) -> Settlement {
    match outcome {
        HandlerOutcome::Ack => Settlement::Commit,
        HandlerOutcome::RejectRequeue { .. } => Settlement::Seek,
        HandlerOutcome::RejectDrop { .. } if has_dead_letter_route => {
            Settlement::DeadLetterThenCommit
        }
        HandlerOutcome::RejectDrop { .. } => Settlement::Commit,
    }
}

// ---------------------------------------------------------------------------
// 拓扑声明
// ---------------------------------------------------------------------------

/// 声明订单主队列和死信队列
///
/// 两个 topic 均按配置的副本数持久化；死信队列永不过期，留待人工排查。
/// topic 已存在时视为成功，保证多实例并发启动时的幂等性。
pub async fn declare_order_topology(config: &KafkaConfig) -> Result<(), SharedError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()
        .map_err(|e| SharedError::Kafka(format!("创建 AdminClient 失败: {e}")))?;

    let replication = TopicReplication::Fixed(config.replication_factor);
    let order_topic = NewTopic::new(&config.order_topic, config.partitions, replication);
    let dead_letter_topic = NewTopic::new(
        &config.dead_letter_topic,
        config.partitions,
        TopicReplication::Fixed(config.replication_factor),
    )
    .set("retention.ms", "-1");

    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));
    let results = admin
        .create_topics(&[order_topic, dead_letter_topic], &options)
        .await
        .map_err(|e| SharedError::Kafka(format!("声明 topic 失败: {e}")))?;

    for result in results {
        match result {
            Ok(topic) => info!(%topic, "topic 已创建"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(%topic, "topic 已存在，跳过")
            }
            Err((topic, code)) => {
                return Err(SharedError::Kafka(format!("创建 topic {topic} 失败: {code}")));
            }
        }
    }

    info!(
        order_topic = %config.order_topic,
        dead_letter_topic = %config.dead_letter_topic,
        partitions = config.partitions,
        replication_factor = config.replication_factor,
        "订单队列拓扑已就绪"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `acks=all` 加幂等生产者等价于持久化投递：broker 全部同步副本落盘后才确认。
    /// 5 秒内无法投递即返回错误，由调用方决定如何处理。
    pub fn new(config: &KafkaConfig) -> Result<Self, SharedError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), SharedError> {
        self.send_with_headers(topic, key, payload, &HashMap::new())
            .await
    }

    /// 发送带 header 的原始字节消息
    pub async fn send_with_headers(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(i32, i64), SharedError> {
        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for (name, value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned_headers);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| SharedError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
        headers: &HashMap<String, String>,
    ) -> Result<(i32, i64), SharedError> {
        let payload = serde_json::to_vec(value)?;
        self.send_with_headers(topic, key, &payload, headers).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交，位点只在处理函数给出 `Ack` 或消息成功转入死信队列后才提交；
/// 进程崩溃或连接断开时未提交的消息会被重新投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    requeue_delay: Duration,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "order-fulfillment" 和 "order-fulfillment.dlq-monitor"。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, SharedError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            // 本地预取队列压到最小，配合逐条处理等价于 prefetch = 1
            .set("queued.min.messages", "1")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, %group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer,
            requeue_delay: config.requeue_delay(),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), SharedError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| SharedError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler，按返回的 [`HandlerOutcome`] 提交、回退或转入死信队列。
    ///   消息严格逐条处理，上一条落地前不会拉取下一条。
    /// - 关闭信号只在两条消息之间被观察到，正在执行的 handler 总能自然完成。
    pub async fn start<F, Fut>(
        self,
        mut shutdown: watch::Receiver<bool>,
        dead_letters: Option<&DlqPublisher>,
        handler: F,
    ) where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = HandlerOutcome>,
    {
        use futures::StreamExt;

        if *shutdown.borrow() {
            info!("启动前已收到关闭信号，Kafka 消费循环不启动");
            return;
        }

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            let outcome = handler(msg.clone()).await;
                            self.settle(&borrowed_msg, &msg, &outcome, dead_letters).await;
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }

    /// 按处理结果落地单条消息
    async fn settle(
        &self,
        borrowed: &BorrowedMessage<'_>,
        msg: &ConsumerMessage,
        outcome: &HandlerOutcome,
        dead_letters: Option<&DlqPublisher>,
    ) {
        match (plan_settlement(outcome, dead_letters.is_some()), dead_letters) {
            (Settlement::DeadLetterThenCommit, Some(dlq)) => {
                let reason = match outcome {
                    HandlerOutcome::RejectDrop { reason } => reason.as_str(),
                    _ => "",
                };
                match dlq.publish(msg, reason).await {
                    Ok(()) => self.commit(borrowed, msg),
                    Err(e) => {
                        // 死信写入失败时绝不能提交，退回重投保证消息不丢
                        error!(
                            error = %e,
                            partition = msg.partition,
                            offset = msg.offset,
                            "写入死信队列失败，消息将重新投递"
                        );
                        self.rewind(msg).await;
                    }
                }
            }
            (Settlement::Seek, _) => self.rewind(msg).await,
            (Settlement::Commit, _) => {
                if let HandlerOutcome::RejectDrop { reason } = outcome {
                    error!(
                        partition = msg.partition,
                        offset = msg.offset,
                        reason = %reason,
                        "未配置死信队列，永久失败的消息被丢弃"
                    );
                }
                self.commit(borrowed, msg);
            }
            (Settlement::DeadLetterThenCommit, None) => self.commit(borrowed, msg),
        }
    }

    /// 同步提交该消息的位点
    fn commit(&self, borrowed: &BorrowedMessage<'_>, msg: &ConsumerMessage) {
        if let Err(e) = self.consumer.commit_message(borrowed, CommitMode::Sync) {
            // 提交失败不影响正确性：消息会被重投，由幂等检查吸收
            warn!(
                error = %e,
                partition = msg.partition,
                offset = msg.offset,
                "提交位点失败，消息可能被重复投递"
            );
        }
    }

    /// 回退到该消息的位点，使其被重新投递
    async fn rewind(&self, msg: &ConsumerMessage) {
        tokio::time::sleep(self.requeue_delay).await;

        if let Err(e) = self.consumer.seek(
            &msg.topic,
            msg.partition,
            Offset::Offset(msg.offset),
            Duration::from_secs(5),
        ) {
            // seek 失败时位点仍未提交，重平衡或重启后同样会重投
            error!(
                error = %e,
                partition = msg.partition,
                offset = msg.offset,
                "回退位点失败"
            );
        } else {
            debug!(
                partition = msg.partition,
                offset = msg.offset,
                "消息已回退，等待重新投递"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: 42,
            key: Some("key-1".to_string()),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::from([("traceparent".to_string(), "abc-123".to_string())]),
        }
    }

    #[test]
    fn test_consumer_message_creation() {
        let msg = make_message(b"hello");

        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.partition, 0);
        assert_eq!(msg.offset, 42);
        assert_eq!(msg.key.as_deref(), Some("key-1"));
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.headers.get("traceparent").unwrap(), "abc-123");
    }

    #[test]
    fn test_consumer_message_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Event {
            user_id: String,
        }

        let msg = make_message(br#"{"user_id":"u-001"}"#);
        let event: Event = msg.deserialize_payload().unwrap();
        assert_eq!(
            event,
            Event {
                user_id: "u-001".to_string()
            }
        );

        let bad = make_message(b"not json");
        let result: Result<serde_json::Value, _> = bad.deserialize_payload();
        assert!(result.is_err());
    }

    #[test]
    fn test_consumer_message_payload_str_invalid_utf8() {
        assert_eq!(make_message(b"hello world").payload_str().unwrap(), "hello world");
        assert!(make_message(&[0xFF, 0xFE]).payload_str().is_err());
    }

    #[test]
    fn test_ack_commits() {
        assert_eq!(
            plan_settlement(&HandlerOutcome::Ack, true),
            Settlement::Commit
        );
        assert_eq!(
            plan_settlement(&HandlerOutcome::Ack, false),
            Settlement::Commit
        );
    }

    #[test]
    fn test_requeue_never_commits() {
        let outcome = HandlerOutcome::requeue("redis down");
        assert_eq!(plan_settlement(&outcome, true), Settlement::Seek);
        assert_eq!(plan_settlement(&outcome, false), Settlement::Seek);
    }

    #[test]
    fn test_drop_goes_to_dead_letter_when_routed() {
        let outcome = HandlerOutcome::drop_to_dlq("malformed");
        assert_eq!(
            plan_settlement(&outcome, true),
            Settlement::DeadLetterThenCommit
        );
        assert_eq!(plan_settlement(&outcome, false), Settlement::Commit);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(HandlerOutcome::Ack.label(), "ack");
        assert_eq!(HandlerOutcome::requeue("x").label(), "requeue");
        assert_eq!(HandlerOutcome::drop_to_dlq("x").label(), "dead_letter");
    }
}
