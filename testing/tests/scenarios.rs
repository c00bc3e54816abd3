//! End-to-end scenarios over the in-memory backends
//!
//! Covers the guarantees the pieces give together: eviction visibility,
//! write-then-read from the local tier, lease mutual exclusion, oversell
//! protection under concurrent decrements, a decrement and its event
//! sharing one unit of work, and outbox delivery with an idempotent
//! consumer.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use fleet_sync_core::broker::MessageBroker;
use fleet_sync_core::cache::{InvalidationBus, SharedCache};
use fleet_sync_core::key::KeyContext;
use fleet_sync_core::lock::LockService;
use fleet_sync_core::outbox::{NewOutboxRecord, OutboxRepository};
use fleet_sync_core::unit_of_work::UnitOfWork;
use fleet_sync_runtime::{
    CacheConfig, CacheCoordinator, CacheSpec, Handled, IdempotentConsumer, LockConfig, Locker,
    OutboxConfig, OutboxPublisher, StockError, StockRepository, StockService,
};
use fleet_sync_testing::helpers::init_tracing;
use fleet_sync_testing::properties::{DecrementPlan, decrement_plan};
use fleet_sync_testing::{
    InMemoryInvalidationBus, InMemoryLockService, InMemoryOutboxRepository, InMemorySharedCache,
    InMemoryStockRepository, MockBroker,
};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Backends shared by every process of a simulated fleet.
struct Backends {
    shared: Arc<InMemorySharedCache>,
    bus: Arc<InMemoryInvalidationBus>,
    locks: Arc<InMemoryLockService>,
    outbox: Arc<InMemoryOutboxRepository>,
    stock: Arc<InMemoryStockRepository>,
}

impl Backends {
    fn new() -> Self {
        let outbox = InMemoryOutboxRepository::new();
        Self {
            shared: Arc::new(InMemorySharedCache::new()),
            bus: Arc::new(InMemoryInvalidationBus::new()),
            locks: Arc::new(InMemoryLockService::new()),
            stock: Arc::new(InMemoryStockRepository::new().with_outbox(outbox.clone())),
            outbox: Arc::new(outbox),
        }
    }

    fn cache(&self) -> CacheCoordinator {
        CacheCoordinator::new(
            Arc::clone(&self.shared) as Arc<dyn SharedCache>,
            Arc::clone(&self.bus) as Arc<dyn InvalidationBus>,
            CacheConfig::default(),
        )
    }

    fn locker(&self) -> Locker {
        Locker::new(
            Arc::clone(&self.locks) as Arc<dyn LockService>,
            LockConfig::default().with_times(Duration::from_secs(10), Duration::from_secs(30)),
        )
    }

    fn stock_service(&self) -> StockService {
        StockService::new(
            self.locker(),
            self.cache(),
            Arc::clone(&self.stock) as Arc<dyn StockRepository>,
        )
        .expect("built-in key templates parse")
    }
}

async fn run_decrements(service: &StockService, product_id: i64, amounts: &[i64]) -> Vec<Result<i64, StockError>> {
    let handles: Vec<_> = amounts
        .iter()
        .map(|&amount| {
            let service = service.clone();
            tokio::spawn(async move { service.decrease(product_id, amount, &UnitOfWork::none()).await })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.expect("decrement task panicked"));
    }
    outcomes
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn read_after_delete_never_sees_the_old_value() {
    let backends = Backends::new();
    let cache = backends.cache();
    let spec = CacheSpec::parse("order:", "{orderId}").unwrap();
    let ctx = KeyContext::new().with_arg("orderId", "O1");

    let before: String = cache
        .read(&spec, &ctx, || async { Ok::<_, Infallible>("pending".to_string()) })
        .await
        .unwrap();
    assert_eq!(before, "pending");

    cache
        .evict(&spec, &ctx, || async { Ok::<_, Infallible>(()) })
        .await
        .unwrap();

    let after: String = cache
        .read(&spec, &ctx, || async { Ok::<_, Infallible>("cancelled".to_string()) })
        .await
        .unwrap();
    assert_eq!(after, "cancelled");
}

#[tokio::test]
async fn written_value_is_read_back_from_the_local_tier() {
    let backends = Backends::new();
    let cache = backends.cache();
    let spec = CacheSpec::parse("stock:", "{productId}").unwrap();
    let ctx = KeyContext::new().with_arg("productId", 5);

    let uow = UnitOfWork::begin();
    let written = cache
        .write(&spec, &ctx, &uow, || async { Ok::<_, Infallible>(json!({"quantity": 17})) })
        .await
        .unwrap();
    uow.commit().await.unwrap();

    // The shared tier is unreachable: only the local tier can answer.
    backends.shared.fail_all(true);
    let read: serde_json::Value = cache
        .read(&spec, &ctx, || async {
            Ok::<_, Infallible>(json!({"quantity": -1}))
        })
        .await
        .unwrap();
    assert_eq!(read, written);
}

// ============================================================================
// Lock
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_holder_enters_the_critical_section() {
    let backends = Backends::new();
    let locker = backends.locker();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let locker = locker.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let entered = Arc::clone(&entered);
            tokio::spawn(async move {
                locker
                    .with_lock("stock-1", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(())
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(entered.load(Ordering::SeqCst), 8);
    assert!(!backends.locks.is_held("stock-1"));
}

// ============================================================================
// Stock decrement
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_hundred_fifty_decrements_against_one_hundred_units() {
    init_tracing();
    let backends = Backends::new();
    backends.stock.set(1, 100);
    let service = backends.stock_service();

    let outcomes = run_decrements(&service, 1, &[1; 150]).await;

    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    let insufficient = outcomes
        .iter()
        .filter(|o| matches!(o, Err(StockError::Insufficient { .. })))
        .count();
    assert_eq!(successes, 100);
    assert_eq!(insufficient, 50);
    assert_eq!(backends.stock.get(1), Some(0));
    assert_eq!(service.quantity(1).await.unwrap(), 0);

    // One StockDecreased per success, quantities strictly decreasing
    let staged = backends.outbox.records();
    assert_eq!(staged.len(), 100);
    let mut quantities: Vec<i64> = staged
        .iter()
        .map(|record| serde_json::from_str::<serde_json::Value>(&record.payload).unwrap()["quantity"].as_i64().unwrap())
        .collect();
    quantities.sort_unstable();
    assert_eq!(quantities, (0..100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uniform_oversubscription_serves_floor_of_available() {
    let backends = Backends::new();
    backends.stock.set(2, 23);
    let service = backends.stock_service();

    let outcomes = run_decrements(&service, 2, &[5; 10]).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 4);
    assert_eq!(backends.stock.get(2), Some(3));
}

#[tokio::test]
async fn insufficient_stock_persists_nothing_and_releases_the_lease() {
    let backends = Backends::new();
    backends.stock.set(3, 2);
    let service = backends.stock_service();
    let uow = UnitOfWork::begin();

    let err = service.decrease(3, 5, &uow).await.unwrap_err();
    assert!(matches!(err, StockError::Insufficient { requested: 5, available: 2 }));
    uow.rollback().await.unwrap();

    assert_eq!(backends.stock.get(3), Some(2));
    assert!(backends.outbox.records().is_empty());
    assert!(!backends.locks.is_held("stock-3"));
}

#[tokio::test]
async fn committed_decrement_publishes_quantity_and_event_together() {
    let backends = Backends::new();
    backends.stock.set(4, 10);
    let service = backends.stock_service();
    let uow = UnitOfWork::begin();

    assert_eq!(service.decrease(4, 3, &uow).await.unwrap(), 7);
    assert_eq!(backends.stock.get(4), Some(10));
    assert!(backends.outbox.records().is_empty());
    assert!(backends.locks.is_held("stock-4"));

    uow.commit().await.unwrap();
    assert_eq!(backends.stock.get(4), Some(7));
    let staged = backends.outbox.unpublished();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].aggregate_id, "4");
    assert!(!backends.locks.is_held("stock-4"));
    assert_eq!(service.quantity(4).await.unwrap(), 7);
}

#[tokio::test]
async fn rolled_back_decrement_leaves_no_stock_change_and_no_event() {
    let backends = Backends::new();
    backends.stock.set(5, 10);
    let service = backends.stock_service();
    let uow = UnitOfWork::begin();

    assert_eq!(service.decrease(5, 4, &uow).await.unwrap(), 6);
    uow.rollback().await.unwrap();

    assert_eq!(backends.stock.get(5), Some(10));
    assert!(backends.outbox.unpublished().is_empty());
    assert!(!backends.locks.is_held("stock-5"));
    assert_eq!(service.quantity(5).await.unwrap(), 10);
}

#[tokio::test]
async fn failed_event_staging_fails_the_decrement_and_persists_nothing() {
    let backends = Backends::new();
    backends.stock.set(6, 10);
    backends.outbox.fail_all(true);
    let service = backends.stock_service();
    let uow = UnitOfWork::begin();

    let err = service.decrease(6, 1, &uow).await.unwrap_err();
    assert!(matches!(err, StockError::Outbox(_)));
    uow.rollback().await.unwrap();

    backends.outbox.fail_all(false);
    assert_eq!(backends.stock.get(6), Some(10));
    assert!(backends.outbox.records().is_empty());
    assert!(!backends.locks.is_held("stock-6"));

    // Without a unit of work the failure is just as clean.
    backends.outbox.fail_all(true);
    let err = service.decrease(6, 1, &UnitOfWork::none()).await.unwrap_err();
    assert!(matches!(err, StockError::Outbox(_)));
    assert_eq!(backends.stock.get(6), Some(10));
}

fn check_plan(plan: &DecrementPlan) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let backends = Backends::new();
        backends.stock.set(9, plan.initial);
        let service = backends.stock_service();

        let outcomes = run_decrements(&service, 9, &plan.amounts).await;
        let taken: i64 = outcomes
            .iter()
            .zip(&plan.amounts)
            .filter(|(outcome, _)| outcome.is_ok())
            .map(|(_, amount)| amount)
            .sum();
        let remaining = backends.stock.get(9).unwrap();

        assert!(remaining >= 0);
        assert_eq!(remaining, plan.initial - taken);
        if plan.total() <= plan.initial {
            assert!(outcomes.iter().all(Result::is_ok));
        }
        for (outcome, amount) in outcomes.iter().zip(&plan.amounts) {
            if let Err(e) = outcome {
                assert!(
                    matches!(e, StockError::Insufficient { requested, available } if requested == amount && available < amount),
                    "unexpected failure: {e}"
                );
            }
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_decrements_never_oversell(plan in decrement_plan()) {
        check_plan(&plan);
    }
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn staged_order_is_published_once_by_a_tick() {
    let backends = Backends::new();
    let broker = Arc::new(MockBroker::new());
    let publisher = OutboxPublisher::new(
        Arc::clone(&backends.outbox) as Arc<dyn OutboxRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
        OutboxConfig::default().with_topic("order-events"),
    );

    let record = backends
        .outbox
        .stage(NewOutboxRecord::new("O1", "OrderCreated", &json!({"orderId": "O1", "total": 4200})).unwrap())
        .await
        .unwrap();
    assert!(!record.published);

    let report = publisher.tick().await.unwrap();
    assert_eq!(report.published, 1);
    assert!(backends.outbox.record(record.id).unwrap().published);

    let sent = broker.sent_to("order-events");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, "O1");
    assert_eq!(sent[0].envelope.event_type, "OrderCreated");
    assert_eq!(sent[0].envelope.payload["total"], 4200);
}

#[tokio::test]
async fn duplicate_deliveries_apply_the_effect_once() {
    // Order service side
    let orders = Arc::new(InMemoryOutboxRepository::new());
    let broker = Arc::new(MockBroker::new());
    let order_publisher = OutboxPublisher::new(
        Arc::clone(&orders) as Arc<dyn OutboxRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
        OutboxConfig::default().with_topic("order-events"),
    );

    // Payment service side
    let payments = Arc::new(InMemoryOutboxRepository::new());
    let payment_publisher = OutboxPublisher::new(
        Arc::clone(&payments) as Arc<dyn OutboxRepository>,
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
        OutboxConfig::default().with_topic("payment-events"),
    );
    let consumer = IdempotentConsumer::new(Arc::clone(&payments) as Arc<dyn OutboxRepository>);
    let charges = AtomicUsize::new(0);

    let mut deliveries = broker.subscribe(&["order-events"]).await.unwrap();

    for _ in 0..2 {
        orders
            .stage(NewOutboxRecord::new("O1", "OrderCreated", &json!({"orderId": "O1"})).unwrap())
            .await
            .unwrap();
    }
    assert_eq!(order_publisher.tick().await.unwrap().published, 2);

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let delivery = deliveries.next().await.unwrap().unwrap();
        let aggregate_id = delivery.key.unwrap();
        let outcome = consumer
            .handle(&aggregate_id, || async {
                charges.fetch_add(1, Ordering::SeqCst);
                payments
                    .stage(NewOutboxRecord::new(aggregate_id.as_str(), "PaymentCompleted", &json!({"orderId": aggregate_id}))?)
                    .await
            })
            .await
            .unwrap();
        outcomes.push(outcome.is_applied());
        payment_publisher.tick().await.unwrap();
    }

    assert_eq!(outcomes, vec![true, false]);
    assert_eq!(charges.load(Ordering::SeqCst), 1);
    assert_eq!(broker.sent_to("payment-events").len(), 1);
    assert!(matches!(
        consumer.handle("O1", || async { Ok::<_, Infallible>(()) }).await.unwrap(),
        Handled::Duplicate
    ));
}
