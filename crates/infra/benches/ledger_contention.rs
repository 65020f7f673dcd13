use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

use stockflow_core::{OrderId, ProductId};
use stockflow_events::{EventBus, EventEnvelope, Subscription};
use stockflow_infra::ledger_store::{AdjustmentKey, InMemoryLedgerStore, StockLedgerStore};
use stockflow_infra::notifications::NotificationPublisher;
use stockflow_infra::reconciler::ReconciliationEngine;
use stockflow_infra::retry::RetryPolicy;
use stockflow_inventory::{InboundEvent, OrderCreated, OrderLineItem};

const OPS_PER_THREAD: u64 = 500;

/// Drops every notification so long runs don't accumulate history.
struct DiscardBus;

impl EventBus<EventEnvelope<JsonValue>> for DiscardBus {
    type Error = std::convert::Infallible;

    fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        let (_tx, rx) = std::sync::mpsc::channel();
        Subscription::new(rx)
    }
}

fn bench_atomic_adjust_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic_adjust_contention");

    for threads in [1u64, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(threads * OPS_PER_THREAD));
        group.bench_with_input(BenchmarkId::new("single_product", threads), threads, |b, &threads| {
            let store = Arc::new(InMemoryLedgerStore::new());
            let product = ProductId::new();
            store.create_if_absent(product, 0).unwrap();

            b.iter(|| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        let store = store.clone();
                        thread::spawn(move || {
                            for _ in 0..OPS_PER_THREAD {
                                black_box(store.atomic_adjust(product, -1).unwrap());
                            }
                        })
                    })
                    .collect();
                for w in workers {
                    w.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_adjust_once(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjust_once");

    group.bench_function("fresh_key", |b| {
        let store = InMemoryLedgerStore::new();
        let product = ProductId::new();
        store.create_if_absent(product, 0).unwrap();

        b.iter(|| {
            let key = AdjustmentKey::new(Uuid::now_v7(), 0);
            black_box(store.adjust_once(key, product, -1).unwrap());
        });
    });

    group.bench_function("replayed_key", |b| {
        let store = InMemoryLedgerStore::new();
        let product = ProductId::new();
        store.create_if_absent(product, 0).unwrap();
        let key = AdjustmentKey::new(Uuid::now_v7(), 0);
        store.adjust_once(key, product, -1).unwrap();

        b.iter(|| {
            black_box(store.adjust_once(key, product, -1).unwrap());
        });
    });

    group.finish();
}

fn bench_order_reconciliation(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_reconciliation");

    for lines in [1usize, 10, 50].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::new("order_created", lines), lines, |b, &lines| {
            let store = Arc::new(InMemoryLedgerStore::new());
            let engine = ReconciliationEngine::new(
                store.clone(),
                NotificationPublisher::new(DiscardBus, RetryPolicy::no_retry()),
            );

            let products: Vec<ProductId> = (0..lines).map(|_| ProductId::new()).collect();
            for product in &products {
                store.create_if_absent(*product, 1_000_000).unwrap();
            }

            b.iter(|| {
                let event = InboundEvent::OrderCreated(OrderCreated {
                    order_id: OrderId::new(),
                    items: products.iter().map(|p| OrderLineItem::new(*p, 1)).collect(),
                });
                black_box(engine.route(Uuid::now_v7(), &event).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_atomic_adjust_contention,
    bench_adjust_once,
    bench_order_reconciliation
);
criterion_main!(benches);
