//! 内存测试替身
//!
//! 与 Postgres/Redis/Kafka 实现遵守同样的守卫语义（状态守卫、库存守卫、全有或全无），
//! 用于场景测试与性质测试。每个替身都带有故障开关和调用计数。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shop_shared::error::SharedError;
use shop_shared::events::OrderEvent;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cart::CartSource;
use crate::creation::OrderEventPublisher;
use crate::error::{OrderError, Result};
use crate::ledger::IdempotencyLedger;
use crate::models::{CheckoutLine, NewOrder, Order, OrderStatus};
use crate::store::{FulfillmentOutcome, OrderRepository, OrderStore};

fn store_outage() -> OrderError {
    OrderError::Database(sqlx::Error::PoolTimedOut)
}

// ---------------------------------------------------------------------------
// MemoryOrderStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    orders: HashMap<Uuid, Order>,
    stock: HashMap<Uuid, i32>,
    products: HashMap<Uuid, Decimal>,
}

/// 内存订单存储
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
    mark_failed_unavailable: AtomicBool,
    calls: AtomicUsize,
    fulfill_calls: AtomicUsize,
    mark_failed_calls: AtomicUsize,
    fulfill_delay_ms: AtomicU64,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 上架商品并设置库存
    pub async fn add_product(&self, price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.products.insert(id, price);
        state.stock.insert(id, stock);
        id
    }

    /// 直接写入一个 created 订单（绕过创建服务）
    pub async fn seed_order(&self, user_id: Uuid, lines: &[(Uuid, i32)]) -> Order {
        let mut state = self.state.lock().await;
        let checkout: Vec<CheckoutLine> = lines
            .iter()
            .map(|(product_id, quantity)| CheckoutLine {
                product_id: *product_id,
                quantity: *quantity,
                unit_price: state
                    .products
                    .get(product_id)
                    .copied()
                    .unwrap_or_default(),
            })
            .collect();
        let order = Self::materialize(&NewOrder::from_lines(user_id, &checkout));
        state.orders.insert(order.id, order.clone());
        order
    }

    pub async fn stock(&self, product_id: Uuid) -> Option<i32> {
        self.state.lock().await.stock.get(&product_id).copied()
    }

    pub async fn status(&self, order_id: Uuid) -> Option<OrderStatus> {
        self.state
            .lock()
            .await
            .orders
            .get(&order_id)
            .map(|order| order.status)
    }

    /// 回拨订单创建时间，模拟滞留订单
    pub async fn backdate(&self, order_id: Uuid, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(&order_id)
            && let Ok(by) = chrono::Duration::from_std(by)
        {
            order.created_at -= by;
        }
    }

    /// 模拟整个存储不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 仅让 mark_failed 不可用
    pub fn set_mark_failed_unavailable(&self, unavailable: bool) {
        self.mark_failed_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// 所有存储接口的调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fulfill_calls(&self) -> usize {
        self.fulfill_calls.load(Ordering::SeqCst)
    }

    pub fn mark_failed_calls(&self) -> usize {
        self.mark_failed_calls.load(Ordering::SeqCst)
    }

    /// 让 fulfill 在开始事务前先等待，模拟锁等待或慢查询
    pub fn set_fulfill_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.fulfill_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(store_outage());
        }
        Ok(())
    }

    fn materialize(order: &NewOrder) -> Order {
        let now = Utc::now();
        Order {
            id: order.id,
            user_id: order.user_id,
            status: OrderStatus::Created,
            total_price: order.total_price,
            items: order.items.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.enter()?;
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn fulfill(&self, order: &Order) -> Result<FulfillmentOutcome> {
        self.enter()?;
        self.fulfill_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.fulfill_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        // 整个事务持有锁，对应 Postgres 的订单行锁
        let mut state = self.state.lock().await;

        match state.orders.get(&order.id) {
            Some(current) if current.status == OrderStatus::Created => {}
            _ => return Ok(FulfillmentOutcome::AlreadyHandled),
        }

        // 先在副本上扣减，全部成功才写回
        let mut stock = state.stock.clone();
        for item in &order.items {
            if item.quantity <= 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id,
                    quantity: item.quantity,
                });
            }
            let available = stock
                .get_mut(&item.product_id)
                .ok_or(OrderError::ProductNotFound(item.product_id))?;
            if *available < item.quantity {
                return Err(OrderError::InsufficientStock {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available: *available,
                });
            }
            *available -= item.quantity;
        }

        state.stock = stock;
        if let Some(current) = state.orders.get_mut(&order.id) {
            current.status = OrderStatus::Completed;
            current.updated_at = Utc::now();
        }
        Ok(FulfillmentOutcome::Completed)
    }

    async fn mark_failed(&self, order_id: Uuid) -> Result<bool> {
        self.enter()?;
        self.mark_failed_calls.fetch_add(1, Ordering::SeqCst);
        if self.mark_failed_unavailable.load(Ordering::SeqCst) {
            return Err(store_outage());
        }

        let mut state = self.state.lock().await;
        match state.orders.get_mut(&order_id) {
            Some(order) if order.status == OrderStatus::Created => {
                order.status = OrderStatus::Failed;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderStore {
    async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        self.enter()?;
        let created = Self::materialize(order);
        self.state
            .lock()
            .await
            .orders
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_pending_order(&self, order_id: Uuid) -> Result<bool> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let pending = state
            .orders
            .get(&order_id)
            .is_some_and(|order| order.status == OrderStatus::Created);
        if pending {
            state.orders.remove(&order_id);
        }
        Ok(pending)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.get_order(order_id).await
    }

    async fn list_orders_by_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        self.enter()?;
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn stale_created_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>> {
        self.enter()?;
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|order| order.status == OrderStatus::Created && order.created_at < created_before)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.created_at);
        orders.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(orders)
    }
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

/// 内存幂等账本
#[derive(Default)]
pub struct MemoryLedger {
    processed: Mutex<HashSet<Uuid>>,
    unavailable: AtomicBool,
    marks: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, order_id: Uuid) -> bool {
        self.processed.lock().await.contains(&order_id)
    }

    pub async fn insert(&self, order_id: Uuid) {
        self.processed.lock().await.insert(order_id);
    }

    /// 模拟 Redis 不可用（查询与写入均失败）
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 成功写入的次数
    pub fn marks(&self) -> usize {
        self.marks.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SharedError::Timeout {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn is_processed(&self, order_id: Uuid) -> Result<bool> {
        self.check("ledger exists")?;
        Ok(self.contains(order_id).await)
    }

    async fn mark_processed(&self, order_id: Uuid, _ttl: Duration) -> Result<()> {
        self.check("ledger set")?;
        self.insert(order_id).await;
        self.marks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// 记录发布内容的事件发布器
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<OrderEvent>>,
    unavailable: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<OrderEvent> {
        self.events.lock().await.clone()
    }

    /// 模拟 broker 不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderEventPublisher for RecordingPublisher {
    async fn publish(&self, event: &OrderEvent) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SharedError::Kafka("broker unavailable".to_string()).into());
        }
        self.events.lock().await.push(*event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCart
// ---------------------------------------------------------------------------

/// 内存购物车
#[derive(Default)]
pub struct MemoryCart {
    lines: Mutex<HashMap<Uuid, Vec<CheckoutLine>>>,
}

impl MemoryCart {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, user_id: Uuid, line: CheckoutLine) {
        self.lines
            .lock()
            .await
            .entry(user_id)
            .or_default()
            .push(line);
    }

    pub async fn len(&self, user_id: Uuid) -> usize {
        self.lines
            .lock()
            .await
            .get(&user_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl CartSource for MemoryCart {
    async fn checkout_lines(&self, user_id: Uuid) -> Result<Vec<CheckoutLine>> {
        Ok(self
            .lines
            .lock()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, user_id: Uuid) -> Result<()> {
        self.lines.lock().await.remove(&user_id);
        Ok(())
    }
}
