// 整理流水线场景测试
//
// 常数列剔除、单列坏行、主运算失败降级、恒等归一化、幂等性
//
// 运行：cargo test --test curation_scenario_test -- --nocapture

use std::sync::Arc;

use tsfeature::{
    curate, BatchScheduler, ComputeError, CurationConfig, CurationStage, FieldValue, MasterInfo,
    MasterRegistry, MemorySnapshotStore, Operation, Quality, ResultBundle, Snapshot,
    SnapshotStore, TimeSeries, ValueStore,
};

/// 测试辅助：行主序值 → 快照 (NaN 记为 Error)
fn build_snapshot(rows: usize, cols: usize, values: &[f64]) -> Snapshot {
    let ts = (0..rows)
        .map(|r| TimeSeries::new(r as u64 + 1, format!("ts_{}", r + 1), vec![r as f64; 4]))
        .collect();
    let ops = (0..cols)
        .map(|c| Operation::new(c as u64 + 1, format!("op_{}", c + 1), 1, "value").unwrap())
        .collect();
    let mut store = ValueStore::new(ts, ops);
    for r in 0..rows {
        for c in 0..cols {
            let v = values[r * cols + c];
            let q = if v.is_finite() { Quality::Good } else { Quality::Error };
            store.set_cell(r, c, v, q, 0.001);
        }
    }
    Snapshot::new(
        store,
        vec![MasterInfo {
            id: 1,
            label: "m".into(),
        }],
    )
}

// ============================================================================
// 3×3 矩阵，一列全为 5.0
// ============================================================================
#[test]
fn test_constant_column_scenario() {
    println!("\n============ 场景: 常数列 ============");

    let snapshot = build_snapshot(3, 3, &[1.0, 5.0, 9.0, 2.0, 5.0, 4.0, 8.0, 5.0, 3.0]);
    let config = CurationConfig::default().with_thresholds(0.7, 1.0);
    let outcome = curate(snapshot, &config).unwrap();

    let store = &outcome.snapshot.store;
    println!("结果形状: {:?}", store.shape());
    assert_eq!(store.shape(), (3, 2));
    assert!(store.column_of(2).is_none());
    assert_eq!(store.value(2, 1), 3.0);
}

// ============================================================================
// 10 条序列，1 个运算，9/10 好值
// ============================================================================
#[test]
fn test_single_operation_bad_row_scenario() {
    println!("\n============ 场景: 单列坏行 ============");

    let values: Vec<f64> = (0..10)
        .map(|i| if i == 7 { f64::NAN } else { i as f64 * 0.5 })
        .collect();
    let snapshot = build_snapshot(10, 1, &values);
    let config = CurationConfig::default().with_thresholds(0.8, 1.0);
    let outcome = curate(snapshot, &config).unwrap();

    let store = &outcome.snapshot.store;
    assert_eq!(store.shape(), (9, 1));
    assert!(store.row_of(8).is_none());
    assert_eq!(
        outcome.report.stage(CurationStage::RowFilter).unwrap().rows_removed,
        1
    );
    assert_eq!(
        outcome.report.stage(CurationStage::ColumnFilter).unwrap().cols_removed,
        0
    );
}

// ============================================================================
// 主运算对某条序列失败
// ============================================================================
#[test]
fn test_master_failure_scenario() {
    println!("\n============ 场景: 主运算失败 ============");

    let mut registry = MasterRegistry::new();
    registry
        .register(
            7,
            "picky",
            Arc::new(|data: &[f64]| {
                if data.iter().any(|x| *x < 0.0) {
                    return Err(ComputeError::InvalidInput("negative sample".into()));
                }
                let sum: f64 = data.iter().sum();
                Ok(ResultBundle::from_fields([
                    ("sum", FieldValue::Scalar(sum)),
                    ("parts", FieldValue::Array(data.to_vec())),
                ]))
            }),
        )
        .unwrap();

    let ops = vec![
        registry.parse_operation(1, "Sum", "picky.sum").unwrap(),
        registry.parse_operation(2, "First", "picky.parts[0]").unwrap(),
        registry.parse_operation(3, "Max", "picky.parts|max").unwrap(),
    ];
    let scheduler = BatchScheduler::with_registry(registry);
    let mut snapshot = scheduler.new_snapshot(
        vec![
            TimeSeries::new(1, "ok", vec![1.0, 2.0, 3.0]),
            TimeSeries::new(2, "bad", vec![1.0, -2.0, 3.0]),
        ],
        ops,
    );

    let report = scheduler.run_snapshot(&mut snapshot).unwrap();
    assert_eq!(report.failed_evaluations, 1);

    let store = &snapshot.store;
    for c in 0..3 {
        assert_eq!(store.quality_at(1, c), Quality::Error);
        assert!(store.value(1, c).is_nan());
        assert_eq!(store.calc_time_at(1, c), 0.0);
        assert_eq!(store.quality_at(0, c), Quality::Good);
    }
    assert_eq!(store.value(0, 0), 6.0);
    assert_eq!(store.value(0, 1), 1.0);
    assert_eq!(store.value(0, 2), 3.0);
}

// ============================================================================
// 恒等归一化
// ============================================================================
#[test]
fn test_identity_normalization_scenario() {
    println!("\n============ 场景: 恒等归一化 ============");

    let values = [
        0.125, -7.5, 3.0e10, 2.0, 0.3, -1.0e-8, 4.75, 1.0 / 3.0, 6.0, 9.5, -0.5, 17.0,
    ];
    let snapshot = build_snapshot(4, 3, &values);
    let before = snapshot.store.values().clone();

    let config = CurationConfig::default().with_norm("none").with_thresholds(1.0, 1.0);
    let outcome = curate(snapshot, &config).unwrap();

    let after = outcome.snapshot.store.values();
    assert_eq!(after.shape(), before.shape());
    for (a, b) in after.as_slice().iter().zip(before.as_slice()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    assert!(outcome.report.stage(CurationStage::Normalize).unwrap().skipped);
}

// ============================================================================
// 幂等性 + 内存快照存储
// ============================================================================
#[test]
fn test_idempotent_curation_via_memory_store() {
    println!("\n============ 幂等性 ============");

    let n = f64::NAN;
    let values = [
        1.0, 2.0, 3.0, 4.0, //
        2.0, n, 1.0, 8.0, //
        5.0, 1.0, 9.0, 2.0, //
        3.0, 7.0, 2.0, 6.0, //
        6.0, 3.0, 4.0, 1.0,
    ];
    let store = MemorySnapshotStore::new();
    store.save("raw", &build_snapshot(5, 4, &values)).unwrap();

    let config = CurationConfig::default()
        .with_norm("zscore")
        .with_thresholds(0.8, 1.0);
    let first = curate(store.load("raw").unwrap(), &config).unwrap();
    println!("第一次: {:?}", first.report.output_shape);
    assert_eq!(first.report.output_shape, (4, 4));
    store.save("curated", &first.snapshot).unwrap();

    let identity = CurationConfig::default()
        .with_norm("none")
        .with_thresholds(0.8, 1.0);
    let second = curate(store.load("curated").unwrap(), &identity).unwrap();
    assert_eq!(second.report.rows_removed(), 0);
    assert_eq!(second.report.cols_removed(), 0);
    assert_eq!(second.snapshot.store.values(), first.snapshot.store.values());
}

// ============================================================================
// 同一 maxmin 配置重复整理
// ============================================================================
#[test]
fn test_repeated_maxmin_curation_is_stable() {
    println!("\n============ 幂等性: maxmin 重复整理 ============");

    let n = f64::NAN;
    let values = [
        1.0, 2.0, 3.0, 4.0, //
        2.0, n, 1.0, 8.0, //
        5.0, 1.0, 9.0, 2.0, //
        3.0, 7.0, 2.0, 6.0, //
        6.0, 3.0, 4.0, 1.0,
    ];
    let store = MemorySnapshotStore::new();
    store.save("raw", &build_snapshot(5, 4, &values)).unwrap();

    let config = CurationConfig::default()
        .with_norm("maxmin")
        .with_thresholds(0.8, 1.0);
    let first = curate(store.load("raw").unwrap(), &config).unwrap();
    assert_eq!(first.report.output_shape, (4, 4));
    store.save("curated", &first.snapshot).unwrap();

    let second = curate(store.load("curated").unwrap(), &config).unwrap();
    println!("第二次: {:?}", second.report.output_shape);
    assert_eq!(second.report.rows_removed(), 0);
    assert_eq!(second.report.cols_removed(), 0);
    assert_eq!(second.snapshot.store.values(), first.snapshot.store.values());
}
