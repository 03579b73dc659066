use allocd_core::types::{AllocationId, TaskId};
use allocd_server::server::{
    allocation::AllocationRegistry,
    streaming::{
        batch::BatchRequest,
        coordinator::stream_batches,
        processor::{BatchStreamProcessor, NeverTerminal, fetch_fn},
    },
};
use bytes::Bytes;
use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::{join_all, ready};
use std::time::Duration;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn rendezvous_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let registry = rt.block_on(async { AllocationRegistry::new(1024, Duration::from_secs(1)) });
    let handle = rt
        .block_on(async {
            registry.register(AllocationId::from("bench.0"), TaskId::from("bench"), None)
        })
        .unwrap();

    let mut group = c.benchmark_group("rendezvous/all_gather");
    for peers in [2_i32, 8, 64] {
        group.throughput(Throughput::Elements(peers as u64));
        group.bench_function(format!("peers/{peers}"), |b| {
            b.to_async(&rt).iter(|| {
                let handle = handle.clone();
                async move {
                    let round = Uuid::new_v4().to_string();
                    let tasks = (0..peers).map(|rank| {
                        let handle = handle.clone();
                        let round = round.clone();
                        tokio::spawn(async move {
                            let watch = handle
                                .watch_all_gather(
                                    round,
                                    Uuid::new_v4(),
                                    peers,
                                    Bytes::from(rank.to_le_bytes().to_vec()),
                                )
                                .await
                                .unwrap();
                            watch.result().await.unwrap()
                        })
                    });
                    for data in join_all(tasks).await {
                        black_box(data.unwrap());
                    }
                }
            });
        });
    }
    group.finish();

    rt.block_on(registry.shutdown());
}

fn processor_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let mut group = c.benchmark_group("processor/drain");
    for (total, batch) in [(10_000_i64, 100_i64), (10_000, 1000), (100_000, 1000)] {
        group.throughput(Throughput::Elements(total as u64));
        group.bench_function(format!("records/{total}/batch/{batch}"), |b| {
            b.to_async(&rt).iter(|| async move {
                let mut next = 0_i64;
                let fetcher = fetch_fn(move |req: BatchRequest| {
                    let end = (next + req.limit).min(total);
                    let records: Vec<i64> = (next..end).collect();
                    next = end;
                    ready(Ok(records))
                });
                let processor = BatchStreamProcessor::new(
                    BatchRequest::new(total, false),
                    fetcher,
                    NeverTerminal,
                    Duration::from_millis(1),
                )
                .max_batch_size(batch);

                let mut rx = stream_batches(processor, CancellationToken::new(), 5, |n: i64| n);
                let mut count = 0_u64;
                while let Some(record) = rx.recv().await {
                    black_box(record.unwrap());
                    count += 1;
                }
                assert_eq!(count, total as u64);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, rendezvous_bench, processor_bench);
criterion_main!(benches);
