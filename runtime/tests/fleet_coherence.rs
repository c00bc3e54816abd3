//! Integration tests for fleet-wide cache coherence
//!
//! Two coordinators share one shared tier and one invalidation bus, each with
//! its own local tier and listener, like two processes of a service.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use fleet_sync_core::cache::{InvalidationBus, SharedCache};
use fleet_sync_core::key::KeyContext;
use fleet_sync_core::lock::LockService;
use fleet_sync_core::unit_of_work::{UnitOfWork, transactional};
use fleet_sync_runtime::{
    CacheConfig, CacheCoordinator, CacheSpec, InvalidationListener, LockConfig, Locker,
    StockError, StockRepository, StockService,
};
use fleet_sync_testing::helpers::eventually;
use fleet_sync_testing::{
    InMemoryInvalidationBus, InMemoryLockService, InMemoryOutboxRepository, InMemorySharedCache,
    InMemoryStockRepository,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Process {
    cache: CacheCoordinator,
    listener: JoinHandle<()>,
}

struct Fleet {
    shared: Arc<InMemorySharedCache>,
    bus: Arc<InMemoryInvalidationBus>,
    shutdown: watch::Sender<bool>,
}

impl Fleet {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(InMemorySharedCache::new()),
            bus: Arc::new(InMemoryInvalidationBus::new()),
            shutdown,
        }
    }

    async fn spawn_process(&self) -> Process {
        let cache = CacheCoordinator::new(
            Arc::clone(&self.shared) as Arc<dyn SharedCache>,
            Arc::clone(&self.bus) as Arc<dyn InvalidationBus>,
            CacheConfig::default(),
        );
        let listener = InvalidationListener::spawn(
            cache.clone(),
            Arc::clone(&self.bus) as Arc<dyn InvalidationBus>,
            self.shutdown.subscribe(),
        );
        // Subscribed and tier-1 flushed
        assert!(eventually(Duration::from_secs(1), || cache.resyncs() > 0).await);
        Process { cache, listener }
    }

    async fn stop(self, processes: Vec<Process>) {
        self.shutdown.send(true).unwrap();
        for process in processes {
            process.listener.await.unwrap();
        }
    }
}

fn stock_spec() -> CacheSpec {
    CacheSpec::parse("stock:", "{productId}").unwrap()
}

fn product(id: i64) -> KeyContext {
    KeyContext::new().with_arg("productId", id)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn write_in_one_process_evicts_the_other_local_tier() {
    let fleet = Fleet::new();
    let a = fleet.spawn_process().await;
    let b = fleet.spawn_process().await;

    // B caches the old quantity in both tiers
    let old: i64 = b
        .cache
        .read(&stock_spec(), &product(1), || async { Ok::<_, Infallible>(10) })
        .await
        .unwrap();
    assert_eq!(old, 10);

    // A writes through
    a.cache
        .write(&stock_spec(), &product(1), &UnitOfWork::none(), || async {
            Ok::<_, Infallible>(9_i64)
        })
        .await
        .unwrap();
    assert!(a.cache.local().contains("stock:1"));

    // B drops its stale copy and reloads from the source
    assert!(eventually(Duration::from_secs(1), || !b.cache.local().contains("stock:1")).await);
    let fresh: i64 = b
        .cache
        .read(&stock_spec(), &product(1), || async { Ok::<_, Infallible>(9) })
        .await
        .unwrap();
    assert_eq!(fresh, 9);

    // A's own broadcast came back and was skipped
    assert!(a.cache.local().contains("stock:1"));

    fleet.stop(vec![a, b]).await;
}

#[tokio::test]
async fn rolled_back_write_is_never_broadcast() {
    let fleet = Fleet::new();
    let a = fleet.spawn_process().await;

    let outcome: Result<i64, &str> = transactional(|uow| {
        let cache = a.cache.clone();
        async move {
            cache
                .write(&stock_spec(), &product(2), &uow, || async { Ok::<_, &str>(4_i64) })
                .await
                .map_err(|_| "cache")?;
            Err("payment declined")
        }
    })
    .await;

    assert_eq!(outcome, Err("payment declined"));
    assert_eq!(fleet.shared.value("stock:2"), None);
    assert!(!a.cache.local().contains("stock:2"));
    assert!(fleet.bus.published().is_empty());

    fleet.stop(vec![a]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decrements_from_two_processes_share_one_stock() {
    let fleet = Fleet::new();
    let a = fleet.spawn_process().await;
    let b = fleet.spawn_process().await;

    let locks = Arc::new(InMemoryLockService::new());
    let outbox = InMemoryOutboxRepository::new();
    let stock = Arc::new(
        InMemoryStockRepository::new()
            .with_product(7, 40)
            .with_outbox(outbox.clone()),
    );
    let service = |cache: &CacheCoordinator| {
        StockService::new(
            Locker::new(
                Arc::clone(&locks) as Arc<dyn LockService>,
                LockConfig::default().with_times(Duration::from_secs(10), Duration::from_secs(30)),
            ),
            cache.clone(),
            Arc::clone(&stock) as Arc<dyn StockRepository>,
        )
        .unwrap()
    };
    let services = [service(&a.cache), service(&b.cache)];

    let handles: Vec<JoinHandle<Result<i64, StockError>>> = (0..60)
        .map(|i| {
            let service = services[i % 2].clone();
            tokio::spawn(async move {
                let uow = UnitOfWork::begin();
                let outcome = service.decrease(7, 1, &uow).await;
                match outcome {
                    Ok(_) => uow.commit().await.unwrap(),
                    Err(_) => uow.rollback().await.unwrap(),
                }
                outcome
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, StockError::Insufficient { .. }), "unexpected: {e}"),
        }
    }

    assert_eq!(successes, 40);
    assert_eq!(stock.get(7), Some(0));
    assert_eq!(outbox.records().len(), 40);
    assert_eq!(locks.held_count(), 0);

    // Once the last broadcast has been applied, both processes read the
    // persisted quantity
    for service in &services {
        let mut quantity = service.quantity(7).await.unwrap();
        for _ in 0..200 {
            if quantity == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            quantity = service.quantity(7).await.unwrap();
        }
        assert_eq!(quantity, 0);
    }

    fleet.stop(vec![a, b]).await;
}
