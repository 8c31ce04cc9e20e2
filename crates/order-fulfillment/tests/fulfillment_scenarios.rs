//! 订单履约场景测试
//!
//! 使用内存替身（与 Postgres/Redis 相同的守卫语义）驱动完整的履约决策流程，
//! 覆盖正常履约、库存不足、订单不存在、重复投递、基础设施故障等场景。
//!
//! ## 运行方式
//!
//! ```bash
//! cargo test -p order-fulfillment --test fulfillment_scenarios
//! ```

use std::sync::Arc;

use order_fulfillment::creation::OrderCreationService;
use order_fulfillment::models::{CheckoutLine, OrderStatus};
use order_fulfillment::reconciler::OrderReconciler;
use order_fulfillment::testing::{MemoryCart, MemoryLedger, MemoryOrderStore, RecordingPublisher};
use order_fulfillment::worker::{OrderFulfillmentWorker, WorkerSettings};
use rust_decimal::Decimal;
use shop_shared::config::ReconciliationConfig;
use shop_shared::events::OrderEvent;
use shop_shared::kafka::HandlerOutcome;
use uuid::Uuid;

// ==================== 辅助函数 ====================

struct Harness {
    store: Arc<MemoryOrderStore>,
    ledger: Arc<MemoryLedger>,
    worker: OrderFulfillmentWorker,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryOrderStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let worker = OrderFulfillmentWorker::new(
        store.clone(),
        ledger.clone(),
        WorkerSettings::default(),
    );
    Harness {
        store,
        ledger,
        worker,
    }
}

fn event_bytes(order_id: Uuid, user_id: Uuid) -> Vec<u8> {
    OrderEvent::new(order_id, user_id).to_bytes().unwrap()
}

fn price(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn is_requeue(outcome: &HandlerOutcome) -> bool {
    matches!(outcome, HandlerOutcome::RejectRequeue { .. })
}

fn dropped_reason(outcome: &HandlerOutcome) -> &str {
    match outcome {
        HandlerOutcome::RejectDrop { reason } => reason,
        other => panic!("expected RejectDrop, got {other:?}"),
    }
}

// ==================== 场景测试 ====================

#[tokio::test]
async fn scenario_a_two_items_within_stock_complete() {
    let h = harness();
    let p1 = h.store.add_product(price(1000), 5).await;
    let p2 = h.store.add_product(price(250), 3).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(p1, 2), (p2, 3)]).await;

    let outcome = h.worker.handle(&event_bytes(order.id, user_id)).await;

    assert_eq!(outcome, HandlerOutcome::Ack);
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Completed));
    assert_eq!(h.store.stock(p1).await, Some(3));
    assert_eq!(h.store.stock(p2).await, Some(0));
    assert!(h.ledger.contains(order.id).await);
}

#[tokio::test]
async fn scenario_b_item_exceeding_stock_fails_and_dead_letters() {
    let h = harness();
    let plenty = h.store.add_product(price(100), 10).await;
    let scarce = h.store.add_product(price(100), 1).await;
    let user_id = Uuid::new_v4();
    let order = h
        .store
        .seed_order(user_id, &[(plenty, 4), (scarce, 2)])
        .await;

    let outcome = h.worker.handle(&event_bytes(order.id, user_id)).await;

    assert!(dropped_reason(&outcome).starts_with("insufficient_stock"));
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Failed));
    // 全有或全无：充足的商品也不能被扣减
    assert_eq!(h.store.stock(plenty).await, Some(10));
    assert_eq!(h.store.stock(scarce).await, Some(1));
    assert!(!h.ledger.contains(order.id).await);
}

#[tokio::test]
async fn scenario_c_unknown_order_dead_letters_without_mutation() {
    let h = harness();
    let product = h.store.add_product(price(100), 7).await;

    let outcome = h
        .worker
        .handle(&event_bytes(Uuid::new_v4(), Uuid::new_v4()))
        .await;

    assert!(dropped_reason(&outcome).starts_with("order_not_found"));
    assert_eq!(h.store.fulfill_calls(), 0);
    assert_eq!(h.store.stock(product).await, Some(7));
    assert_eq!(h.ledger.marks(), 0);
}

#[tokio::test]
async fn scenario_d_ledger_hit_acks_with_zero_store_calls() {
    let h = harness();
    let order_id = Uuid::new_v4();
    h.ledger.insert(order_id).await;

    let outcome = h.worker.handle(&event_bytes(order_id, Uuid::new_v4())).await;

    assert_eq!(outcome, HandlerOutcome::Ack);
    assert_eq!(h.store.calls(), 0);
}

// ==================== 性质测试 ====================

#[tokio::test]
async fn same_event_twice_decrements_once() {
    let h = harness();
    let product = h.store.add_product(price(500), 10).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(product, 3)]).await;
    let payload = event_bytes(order.id, user_id);

    assert_eq!(h.worker.handle(&payload).await, HandlerOutcome::Ack);
    assert_eq!(h.worker.handle(&payload).await, HandlerOutcome::Ack);

    assert_eq!(h.store.stock(product).await, Some(7));
    assert_eq!(h.store.fulfill_calls(), 1);
}

#[tokio::test]
async fn duplicate_after_lost_ledger_write_is_absorbed_by_status_guard() {
    let h = harness();
    let product = h.store.add_product(price(500), 10).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(product, 3)]).await;
    let payload = event_bytes(order.id, user_id);

    assert_eq!(h.worker.handle(&payload).await, HandlerOutcome::Ack);

    // 模拟记录丢失的另一实例：空账本，同一个存储
    let fresh_worker = OrderFulfillmentWorker::new(
        h.store.clone(),
        Arc::new(MemoryLedger::new()),
        WorkerSettings::default(),
    );
    assert_eq!(fresh_worker.handle(&payload).await, HandlerOutcome::Ack);

    assert_eq!(h.store.stock(product).await, Some(7));
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Completed));
}

#[tokio::test]
async fn redelivered_failed_order_acks_without_recording_fulfillment() {
    let h = harness();
    let product = h.store.add_product(price(100), 1).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(product, 5)]).await;
    let payload = event_bytes(order.id, user_id);

    let first = h.worker.handle(&payload).await;
    assert!(dropped_reason(&first).starts_with("insufficient_stock"));

    assert_eq!(h.worker.handle(&payload).await, HandlerOutcome::Ack);
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Failed));
    assert!(!h.ledger.contains(order.id).await);
    assert_eq!(h.ledger.marks(), 0);
}

#[tokio::test]
async fn concurrent_deliveries_race_through_the_status_guard() {
    let store = Arc::new(MemoryOrderStore::new());
    let product = store.add_product(price(100), 5).await;
    let user_id = Uuid::new_v4();
    let order = store.seed_order(user_id, &[(product, 5)]).await;
    let payload = event_bytes(order.id, user_id);

    let worker_a = OrderFulfillmentWorker::new(
        store.clone(),
        Arc::new(MemoryLedger::new()),
        WorkerSettings::default(),
    );
    let worker_b = OrderFulfillmentWorker::new(
        store.clone(),
        Arc::new(MemoryLedger::new()),
        WorkerSettings::default(),
    );

    let (a, b) = tokio::join!(worker_a.handle(&payload), worker_b.handle(&payload));

    assert_eq!(a, HandlerOutcome::Ack);
    assert_eq!(b, HandlerOutcome::Ack);
    assert_eq!(store.stock(product).await, Some(0));
    assert_eq!(store.status(order.id).await, Some(OrderStatus::Completed));
}

#[tokio::test]
async fn malformed_event_dead_letters_on_first_attempt() {
    let h = harness();

    for payload in [
        b"".as_slice(),
        b"null",
        br#"{"order_id":42}"#,
        br#"{"user_id":"6a1d2c3b-4e5f-4a6b-8c7d-9e0f1a2b3c4d"}"#,
    ] {
        let outcome = h.worker.handle(payload).await;
        assert!(dropped_reason(&outcome).starts_with("malformed_event"));
    }
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn store_outage_requeues_and_leaves_order_created() {
    let h = harness();
    let product = h.store.add_product(price(100), 5).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(product, 1)]).await;
    let payload = event_bytes(order.id, user_id);

    h.store.set_unavailable(true);
    assert!(is_requeue(&h.worker.handle(&payload).await));
    h.store.set_unavailable(false);

    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Created));
    assert_eq!(h.store.stock(product).await, Some(5));

    // 故障恢复后的重新投递正常完成
    assert_eq!(h.worker.handle(&payload).await, HandlerOutcome::Ack);
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Completed));
}

#[tokio::test]
async fn ledger_outage_requeues_without_touching_store() {
    let h = harness();
    h.ledger.set_unavailable(true);

    let outcome = h
        .worker
        .handle(&event_bytes(Uuid::new_v4(), Uuid::new_v4()))
        .await;

    assert!(is_requeue(&outcome));
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn failed_mark_failed_requeues_and_retry_reaches_failed() {
    let h = harness();
    let product = h.store.add_product(price(100), 1).await;
    let user_id = Uuid::new_v4();
    let order = h.store.seed_order(user_id, &[(product, 2)]).await;
    let payload = event_bytes(order.id, user_id);

    h.store.set_mark_failed_unavailable(true);
    assert!(is_requeue(&h.worker.handle(&payload).await));
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Created));

    h.store.set_mark_failed_unavailable(false);
    let outcome = h.worker.handle(&payload).await;
    assert!(dropped_reason(&outcome).starts_with("insufficient_stock"));
    assert_eq!(h.store.status(order.id).await, Some(OrderStatus::Failed));
}

#[tokio::test]
async fn every_created_order_ends_completed_or_failed() {
    let h = harness();
    let product = h.store.add_product(price(100), 4).await;
    let missing_product = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    let orders = vec![
        h.store.seed_order(user_id, &[(product, 1)]).await,
        h.store.seed_order(user_id, &[(product, 10)]).await,
        h.store.seed_order(user_id, &[(missing_product, 1)]).await,
        h.store.seed_order(user_id, &[(product, 3)]).await,
    ];

    for order in &orders {
        h.worker.handle(&event_bytes(order.id, user_id)).await;
    }

    for order in &orders {
        let status = h.store.status(order.id).await.unwrap();
        assert!(status.is_terminal(), "order {} left in {status}", order.id);
    }
    assert_eq!(h.store.stock(product).await, Some(0));
}

// ==================== 端到端（创建 → 履约） ====================

#[tokio::test]
async fn created_order_is_fulfilled_from_its_published_event() {
    let h = harness();
    let cart = Arc::new(MemoryCart::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let creation = OrderCreationService::new(h.store.clone(), cart.clone(), publisher.clone());

    let product = h.store.add_product(price(1999), 3).await;
    let user_id = Uuid::new_v4();
    cart.put(
        user_id,
        CheckoutLine {
            product_id: product,
            quantity: 2,
            unit_price: price(1999),
        },
    )
    .await;

    let order = creation.create_order(user_id).await.unwrap();
    assert_eq!(order.total_price, price(3998));
    assert_eq!(cart.len(user_id).await, 0);

    let events = publisher.events().await;
    assert_eq!(events, vec![OrderEvent::new(order.id, user_id)]);

    let outcome = h.worker.handle(&events[0].to_bytes().unwrap()).await;
    assert_eq!(outcome, HandlerOutcome::Ack);
    assert_eq!(h.store.stock(product).await, Some(1));

    let fetched = creation.get_order(order.id, user_id).await.unwrap();
    assert_eq!(fetched.status, OrderStatus::Completed);
    assert_eq!(creation.list_orders(user_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn publish_failure_removes_order_and_keeps_cart() {
    let store = Arc::new(MemoryOrderStore::new());
    let cart = Arc::new(MemoryCart::new());
    let publisher = Arc::new(RecordingPublisher::new());
    publisher.set_unavailable(true);
    let creation = OrderCreationService::new(store.clone(), cart.clone(), publisher.clone());

    let user_id = Uuid::new_v4();
    cart.put(
        user_id,
        CheckoutLine {
            product_id: Uuid::new_v4(),
            quantity: 1,
            unit_price: price(500),
        },
    )
    .await;

    assert!(creation.create_order(user_id).await.is_err());
    assert!(creation.list_orders(user_id).await.unwrap().is_empty());
    assert_eq!(cart.len(user_id).await, 1);
}

#[tokio::test]
async fn reconciler_republishes_stale_created_orders_once_fulfilled_they_stop() {
    let h = harness();
    let publisher = Arc::new(RecordingPublisher::new());
    let reconciler = OrderReconciler::new(
        h.store.clone(),
        publisher.clone(),
        &ReconciliationConfig {
            stale_after_seconds: 60,
            batch_size: 10,
            ..Default::default()
        },
    );

    let product = h.store.add_product(price(100), 5).await;
    let user_id = Uuid::new_v4();
    let stale = h.store.seed_order(user_id, &[(product, 1)]).await;
    let fresh = h.store.seed_order(user_id, &[(product, 1)]).await;
    h.store
        .backdate(stale.id, std::time::Duration::from_secs(600))
        .await;

    assert_eq!(reconciler.sweep().await.unwrap(), 1);
    let events = publisher.events().await;
    assert_eq!(events, vec![OrderEvent::new(stale.id, user_id)]);
    assert_ne!(events[0].order_id, fresh.id);

    // 补发的事件完成履约后，订单不再滞留
    h.worker.handle(&events[0].to_bytes().unwrap()).await;
    assert_eq!(reconciler.sweep().await.unwrap(), 0);
}
