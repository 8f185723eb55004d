use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use jobgate_core::{JobIdentity, ManualClock, RateLimiter};
use jobgate_infra::{
    Acquisition, CoordinatorConfig, ExecutionCoordinator, FnJob, InMemoryStateStore, JobError,
    LockManager, LockPolicy, ReleaseOutcome,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Acquire + release round trip with no rate limiting in the way.
fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("acquire_release");
    group.throughput(Throughput::Elements(1));

    let clock = Arc::new(ManualClock::new(0));
    let locks = LockManager::new(
        InMemoryStateStore::arc(),
        clock.clone(),
        RateLimiter::fixed(2, 1).unwrap(),
        LockPolicy::default(),
    );
    let id = JobIdentity::new("bench-job").unwrap();
    rt.block_on(locks.seed(&id)).unwrap();

    group.bench_function("success_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                clock.advance(2);
                let Acquisition::Acquired(lease) = locks.try_acquire(&id).await.unwrap() else {
                    panic!("job should be eligible");
                };
                let record = lease
                    .release(ReleaseOutcome::Success { result_ref: None })
                    .await
                    .unwrap();
                black_box(record.version)
            })
        });
    });

    group.bench_function("rejected_during_cooldown", |b| {
        let cooling = LockManager::new(
            InMemoryStateStore::arc(),
            Arc::new(ManualClock::new(0)),
            RateLimiter::fixed(3600, 300).unwrap(),
            LockPolicy::default(),
        );
        rt.block_on(async {
            cooling.seed(&id).await.unwrap();
            if let Acquisition::Acquired(lease) = cooling.try_acquire(&id).await.unwrap() {
                lease
                    .release(ReleaseOutcome::Success { result_ref: None })
                    .await
                    .unwrap();
            }
        });

        b.iter(|| black_box(rt.block_on(cooling.try_acquire(&id)).unwrap()));
    });

    group.finish();
}

/// Coordinator runs across many distinct identities.
fn bench_coordinator_identities(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("coordinator_identities");

    for count in [10usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let identities: Vec<JobIdentity> = (0..count)
                .map(|i| JobIdentity::new(format!("job-{i}")).unwrap())
                .collect();
            let body = FnJob::new(|| async { Ok::<_, JobError>(None) });

            b.iter(|| {
                let coordinator = ExecutionCoordinator::builder(InMemoryStateStore::arc())
                    .clock(Arc::new(ManualClock::new(0)))
                    .config(CoordinatorConfig::idempotent_daily())
                    .build()
                    .unwrap();
                rt.block_on(async {
                    for id in &identities {
                        black_box(coordinator.run(id, &body).await.unwrap());
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_coordinator_identities);
criterion_main!(benches);
