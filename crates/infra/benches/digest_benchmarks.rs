use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

use loyaltysync_core::{Payload, SystemClock, TypeCode, fingerprint, payload};
use loyaltysync_infra::builder::JobBuilder;
use loyaltysync_infra::digest::JobDigest;
use loyaltysync_infra::registry::{ApiClient, ClientError, HandlerError, RequestTypeRegistry, StaticConnector};
use loyaltysync_infra::store::InMemoryJobStore;

/// Upstream that accepts everything.
struct AcceptAll;

impl ApiClient for AcceptAll {
    fn call(&self, _operation: &str, _body: &JsonValue) -> Result<JsonValue, ClientError> {
        Ok(json!({"ok": true}))
    }
}

fn registry() -> Arc<RequestTypeRegistry> {
    let registry = RequestTypeRegistry::builder()
        .connector(StaticConnector::new("bench").with_default(Arc::new(AcceptAll)))
        .handler_fn("step", "bench", |ctx| {
            let client = ctx.connection()?;
            client
                .call("step", &JsonValue::Object(ctx.arguments()))
                .map_err(|e| HandlerError::Failed(e.into()))
        })
        .build()
        .unwrap();
    Arc::new(registry)
}

fn body(i: usize) -> Payload {
    payload::from_value(json!({"customer_id": i.to_string(), "points": i, "note": "bench"})).unwrap()
}

fn seeded_store(jobs: usize, requests_per_job: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    let mut builder = JobBuilder::new(store.clone(), Arc::new(SystemClock));
    for i in 0..jobs {
        builder.new_job(Some((i % 50).to_string()), None, None);
        for r in 0..requests_per_job {
            builder.add_request(body(i * requests_per_job + r), TypeCode::new("step")).unwrap();
        }
        builder.create(false).unwrap();
    }
    store
}

fn bench_digest_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_cycle");
    let registry = registry();

    for jobs in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*jobs as u64 * 3));
        group.bench_with_input(BenchmarkId::new("jobs_x3_requests", jobs), jobs, |b, &jobs| {
            b.iter_batched(
                || seeded_store(jobs, 3),
                |store| {
                    let digest = JobDigest::new(store, registry.clone(), Arc::new(SystemClock));
                    black_box(digest.run().unwrap())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_builder_debounce(c: &mut Criterion) {
    let mut group = c.benchmark_group("builder_debounce");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_duplicate_triggers", |b| {
        b.iter_batched(
            InMemoryJobStore::arc,
            |store| {
                let mut builder = JobBuilder::new(store, Arc::new(SystemClock));
                for _ in 0..100 {
                    builder.new_job(Some("17".into()), None, None);
                    builder.add_request(body(17), TypeCode::new("step")).unwrap();
                    black_box(builder.create(true).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let code = TypeCode::new(TypeCode::CONTACT_UPDATE);
    let payload = body(42);
    c.bench_function("fingerprint", |b| {
        b.iter(|| black_box(fingerprint(Some("42"), &code, &payload)))
    });
}

criterion_group!(benches, bench_digest_cycle, bench_builder_debounce, bench_fingerprint);
criterion_main!(benches);
