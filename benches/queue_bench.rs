use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use spillway::memory::MemoryManager;
use spillway::queue::PartitionedQueue;
use spillway::state::checkpoint::RangeSet;

fn bench_publish_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitioned_queue");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    for partitions in [1usize, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, &partitions| {
                b.iter(|| {
                    rt.block_on(async {
                        let queue = Arc::new(PartitionedQueue::new(partitions));
                        let mut consumers = Vec::new();
                        for p in 0..partitions {
                            let mut consumer = queue.consume(p).unwrap();
                            consumers.push(tokio::spawn(async move {
                                let mut n = 0u64;
                                while let Some(item) = consumer.next().await {
                                    n += black_box(item);
                                }
                                n
                            }));
                        }
                        for i in 0..10_000u64 {
                            queue.publish(i, (i as usize) % partitions).unwrap();
                        }
                        queue.close();
                        for consumer in consumers {
                            consumer.await.unwrap();
                        }
                    })
                });
            },
        );
    }
    group.finish();
}

fn bench_reserve_release(c: &mut Criterion) {
    let memory = MemoryManager::new(1 << 20);
    c.bench_function("try_reserve_release", |b| {
        b.iter(|| {
            let reserved = memory.try_reserve(black_box(128), ()).unwrap();
            memory.release(reserved);
        });
    });
}

fn bench_range_set(c: &mut Criterion) {
    c.bench_function("range_set_out_of_order", |b| {
        b.iter(|| {
            let mut set = RangeSet::new();
            // Odd batches first, then the even ones fill the gaps.
            for i in (1..1000u64).step_by(2).chain((0..1000u64).step_by(2)) {
                set.insert(i * 100..(i + 1) * 100);
            }
            assert!(set.covers_prefix(black_box(100_000)));
        });
    });
}

criterion_group!(
    benches,
    bench_publish_consume,
    bench_reserve_release,
    bench_range_set
);
criterion_main!(benches);
