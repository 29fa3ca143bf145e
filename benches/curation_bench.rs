// Benchmark 测试：批量计算与矩阵整理
//
// 运行方式：
// cargo bench --bench curation_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use tsfeature::compute::operators::standard_operations;
use tsfeature::{
    curate, BatchScheduler, ComputeMode, CurationConfig, MasterRegistry, SchedulerConfig,
    Snapshot, TimeSeries,
};

/// 创建测试序列
fn create_series(n: usize, len: usize) -> Vec<TimeSeries> {
    (0..n)
        .map(|i| {
            let f = 0.05 + 0.01 * (i % 50) as f64;
            let data = (0..len)
                .map(|t| (t as f64 * f).sin() + 0.001 * (t * (i % 7)) as f64)
                .collect();
            TimeSeries::new(i as u64 + 1, format!("bench_{}", i), data)
        })
        .collect()
}

fn scheduler(parallel: bool) -> BatchScheduler {
    BatchScheduler::new(
        Arc::new(MasterRegistry::with_standard_masters()),
        SchedulerConfig {
            parallel,
            mode: ComputeMode::All,
        },
    )
}

fn computed_snapshot(n: usize) -> Snapshot {
    let scheduler = scheduler(true);
    let ops = standard_operations(scheduler.registry()).unwrap();
    let mut snapshot = scheduler.new_snapshot(create_series(n, 256), ops);
    scheduler.run_snapshot(&mut snapshot).unwrap();
    snapshot
}

/// Benchmark: 批量计算 (串行 vs 并行)
fn bench_batch_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_compute");
    group.sample_size(10);

    for parallel in [false, true] {
        let scheduler = scheduler(parallel);
        let ops = standard_operations(scheduler.registry()).unwrap();
        let template = scheduler.new_snapshot(create_series(200, 256), ops);

        group.bench_with_input(
            BenchmarkId::new(if parallel { "parallel" } else { "serial" }, 200),
            &template,
            |b, template| {
                b.iter(|| {
                    let mut snapshot = template.clone();
                    black_box(scheduler.run_snapshot(&mut snapshot).unwrap());
                });
            },
        );
    }
    group.finish();
}

/// Benchmark: 整理流水线 (不同归一化)
fn bench_curation(c: &mut Criterion) {
    let mut group = c.benchmark_group("curation");
    let snapshot = computed_snapshot(500);

    for norm in ["none", "zscore", "scaled_robust_sigmoid"] {
        let config = CurationConfig::default().with_norm(norm);
        group.bench_with_input(BenchmarkId::from_parameter(norm), &snapshot, |b, snapshot| {
            b.iter(|| black_box(curate(snapshot.clone(), &config).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_batch_compute, bench_curation);
criterion_main!(benches);
