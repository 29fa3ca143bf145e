//! Prometheus 指标导出模块
//!
//! 提供计算与整理流水线的监控指标，包括：
//! - 主运算求值结果与延迟
//! - 按质量码统计的单元格写入
//! - 整理各阶段删除的行列数

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

use crate::store::Quality;

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 主运算指标
    // ═══════════════════════════════════════════════════════════════════

    /// 主运算求值总数 (outcome: success / failed / not_applicable)
    pub static ref MASTER_EVALUATION_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("master_evaluation_total", "Total number of master evaluations")
            .namespace("tsfeature"),
        &["master", "outcome"]
    ).expect("Failed to create MASTER_EVALUATION_TOTAL metric");

    /// 主运算成功求值延迟 (微秒)
    pub static ref MASTER_LATENCY_US: HistogramVec = HistogramVec::new(
        HistogramOpts::new("master_latency_us", "Successful master evaluation latency in microseconds")
            .namespace("tsfeature")
            .buckets(vec![10.0, 100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0]),
        &["master"]
    ).expect("Failed to create MASTER_LATENCY_US metric");

    // ═══════════════════════════════════════════════════════════════════
    // 值矩阵指标
    // ═══════════════════════════════════════════════════════════════════

    /// 批量计算写入的单元格数
    pub static ref CELL_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cell_total", "Matrix cells written by the batch scheduler")
            .namespace("tsfeature"),
        &["quality"]
    ).expect("Failed to create CELL_TOTAL metric");

    // ═══════════════════════════════════════════════════════════════════
    // 整理指标
    // ═══════════════════════════════════════════════════════════════════

    /// 整理阶段删除数 (axis: rows / columns)
    pub static ref CURATION_REMOVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("curation_removed_total", "Rows and columns removed by curation stages")
            .namespace("tsfeature"),
        &["stage", "axis"]
    ).expect("Failed to create CURATION_REMOVED_TOTAL metric");
}

/// 初始化所有指标到 Registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(MASTER_EVALUATION_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(MASTER_LATENCY_US.clone())).ok();
    REGISTRY.register(Box::new(CELL_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CURATION_REMOVED_TOTAL.clone())).ok();

    log::info!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 文本格式
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        log::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 记录一次主运算求值；只有成功的求值计入延迟
pub fn record_master_outcome(master: &str, outcome: &str, elapsed: Option<Duration>) {
    MASTER_EVALUATION_TOTAL
        .with_label_values(&[master, outcome])
        .inc();
    if let (Some(d), "success") = (elapsed, outcome) {
        MASTER_LATENCY_US
            .with_label_values(&[master])
            .observe(d.as_micros() as f64);
    }
}

pub fn record_cell(quality: Quality) {
    CELL_TOTAL.with_label_values(&[quality.as_str()]).inc();
}

pub fn record_curation_removed(stage: &str, axis: &str, count: usize) {
    CURATION_REMOVED_TOTAL
        .with_label_values(&[stage, axis])
        .inc_by(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_export() {
        init_metrics();

        record_master_outcome("moments", "success", Some(Duration::from_micros(40)));
        record_master_outcome("moments", "failed", Some(Duration::ZERO));
        record_cell(Quality::NotApplicable);
        record_curation_removed("row_filter", "rows", 3);

        let output = export_metrics();
        assert!(output.contains("tsfeature_master_evaluation_total"));
        assert!(output.contains("tsfeature_master_latency_us"));
        assert!(output.contains("quality=\"not_applicable\""));
        assert!(output.contains("tsfeature_curation_removed_total"));
    }

    #[test]
    fn test_latency_only_for_success() {
        let before = MASTER_LATENCY_US
            .with_label_values(&["latency_probe"])
            .get_sample_count();
        record_master_outcome("latency_probe", "failed", Some(Duration::ZERO));
        record_master_outcome("latency_probe", "not_applicable", None);
        record_master_outcome("latency_probe", "success", Some(Duration::from_millis(1)));
        let after = MASTER_LATENCY_US
            .with_label_values(&["latency_probe"])
            .get_sample_count();
        assert_eq!(after - before, 1);
    }
}
