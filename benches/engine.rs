//! Engine benchmarks using Criterion, against in-memory sg devices.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sgq::policy::LoopSnapshot;
use sgq::{
    BufferPool, DeviceTarget, Engine, EngineConfig, Favor, LbaRange, MemDisk, MemOpener, OpKind,
    QueuePolicy,
};
use std::sync::Arc;

const DEV: &str = "/dev/sg0";
const COMMANDS: u64 = 2_000;

fn config(op: OpKind, threads: usize, depth: u32) -> EngineConfig {
    EngineConfig {
        threads,
        commands_per_thread: COMMANDS,
        op,
        blocks_per_cmd: 8,
        seed: Some(1),
        devices: vec![DeviceTarget::new(DEV).with_lba(LbaRange::Bounded { start: 0, end: 4096 })],
        ..Default::default()
    }
    .with_queue_depth(depth)
}

fn benchmark_queue_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("noop_queue_depth");
    group.throughput(Throughput::Elements(COMMANDS));
    for depth in [1u32, 4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let opener = MemOpener::new().with_disk(DEV, MemDisk::new(4096, 512));
                let summary = Engine::new(config(OpKind::NoOp, 1, depth), Arc::new(opener))
                    .run()
                    .unwrap();
                black_box(summary.report.completed)
            });
        });
    }
    group.finish();
}

fn benchmark_read_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_4k_threads");
    for threads in [1usize, 2, 4] {
        group.throughput(Throughput::Bytes(COMMANDS * threads as u64 * 4096));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let opener = MemOpener::new().with_disk(DEV, MemDisk::new(4096, 512));
                let summary = Engine::new(config(OpKind::Read, threads, 16), Arc::new(opener))
                    .run()
                    .unwrap();
                black_box(summary.report.completed)
            });
        });
    }
    group.finish();
}

fn benchmark_policy(c: &mut Criterion) {
    let policy = QueuePolicy {
        max_queue_depth: 32,
        favor: Favor::Submit,
        watermark: Some(24),
    };
    c.bench_function("policy_next_action", |b| {
        b.iter(|| {
            let mut n = 0u32;
            for outstanding in 0..32 {
                let snap = LoopSnapshot {
                    submitted: 10,
                    target: 1_000,
                    outstanding,
                    ready: outstanding / 2,
                    force_drain: false,
                };
                if let sgq::Action::Drain(k) = policy.next_action(black_box(&snap)) {
                    n += k;
                }
            }
            n
        });
    });
}

fn benchmark_buffer_pool(c: &mut Criterion) {
    let mut pool = BufferPool::new(4096);
    c.bench_function("buffer_pool_acquire_release", |b| {
        b.iter(|| {
            let buf = pool.acquire().unwrap();
            black_box(buf.len());
            pool.release(buf);
        });
    });
}

criterion_group!(
    benches,
    benchmark_queue_depth,
    benchmark_read_threads,
    benchmark_policy,
    benchmark_buffer_pool
);
criterion_main!(benches);
