//! 批量调度器
//!
//! 对每条时间序列、每个被请求的主运算只求值一次，结果包 (`Arc<ResultBundle>`)
//! 在该序列内共享给所有依赖它的指针运算。
//!
//! 耗时归属：主运算的完整耗时记在第一个被写入的依赖单元格 (列号最小) 上，
//! 其余依赖单元格记 0；失败或不适用的主运算全部记 0。
//!
//! 并行模式按行 (时间序列) 切分，每个任务只产出自己的行，最后顺序写回。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::master::{evaluate_master, MasterOperation, MasterRegistry, ResultBundle};
use super::resolver::extract;
use crate::observability::metrics;
use crate::store::{Operation, Quality, QualityCounts, Snapshot, TimeSeries, ValueStore};
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 配置
// ═══════════════════════════════════════════════════════════════════════════

/// 计算哪些单元格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    /// 全部重算
    All,
    /// 只算 NotComputed
    #[default]
    Missing,
    /// NotComputed 或 Error
    MissingOrError,
}

impl ComputeMode {
    pub fn selects(self, quality: Quality) -> bool {
        match self {
            ComputeMode::All => true,
            ComputeMode::Missing => quality == Quality::NotComputed,
            ComputeMode::MissingOrError => {
                matches!(quality, Quality::NotComputed | Quality::Error)
            }
        }
    }
}

impl FromStr for ComputeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(ComputeMode::All),
            "missing" => Ok(ComputeMode::Missing),
            "missing_or_error" => Ok(ComputeMode::MissingOrError),
            other => Err(Error::InvalidConfig(format!("unknown compute mode '{}'", other))),
        }
    }
}

/// 调度器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 按时间序列并行
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub mode: ComputeMode,
}

// ═══════════════════════════════════════════════════════════════════════════
// 结果
// ═══════════════════════════════════════════════════════════════════════════

/// 一个单元格的计算结果
#[derive(Debug, Clone)]
pub struct CellResult {
    pub col: usize,
    pub value: f64,
    pub quality: Quality,
    pub seconds: f64,
    pub master_id: u64,
    /// 产生该值的结果包 (同一序列同一主运算的依赖共享同一实例)
    pub bundle: Arc<ResultBundle>,
}

/// 一行 (一条时间序列) 的计算结果
#[derive(Debug, Clone, Default)]
pub struct RowEvaluation {
    pub row: usize,
    pub cells: Vec<CellResult>,
    pub evaluations: usize,
    pub failed: usize,
    pub not_applicable: usize,
    pub master_seconds: f64,
}

/// 批量计算报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub series_processed: usize,
    pub master_evaluations: usize,
    pub failed_evaluations: usize,
    pub not_applicable_evaluations: usize,
    /// 本次写入的单元格按质量码计数
    pub cells: QualityCounts,
    /// 主运算总耗时 (秒)，等于写入的 calc_time 之和
    pub master_seconds: f64,
    pub elapsed: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════
// 调度器
// ═══════════════════════════════════════════════════════════════════════════

type MasterGroups<'a> = Vec<(&'a MasterOperation, Vec<usize>)>;

/// 批量调度器
pub struct BatchScheduler {
    registry: Arc<MasterRegistry>,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(registry: Arc<MasterRegistry>, config: SchedulerConfig) -> Self {
        Self { registry, config }
    }

    pub fn with_registry(registry: MasterRegistry) -> Self {
        Self::new(Arc::new(registry), SchedulerConfig::default())
    }

    pub fn registry(&self) -> &MasterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 创建空白快照 (全部单元格 NotComputed)，主运算元数据取自注册表
    pub fn new_snapshot(&self, time_series: Vec<TimeSeries>, operations: Vec<Operation>) -> Snapshot {
        Snapshot::new(ValueStore::new(time_series, operations), self.registry.infos())
    }

    /// 按主运算分组，列号升序；引用未注册主运算时报错
    fn group_by_master<'a>(&'a self, operations: &[Operation]) -> Result<MasterGroups<'a>> {
        let mut groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (col, op) in operations.iter().enumerate() {
            groups.entry(op.master_id).or_default().push(col);
        }

        groups
            .into_iter()
            .map(|(master_id, cols)| {
                let master = self.registry.get(master_id).ok_or_else(|| {
                    Error::UnknownMaster(format!("master id {} is not registered", master_id))
                })?;
                Ok((master, cols))
            })
            .collect()
    }

    fn evaluate_row_grouped(
        &self,
        store: &ValueStore,
        row: usize,
        groups: &MasterGroups<'_>,
    ) -> RowEvaluation {
        let series = &store.time_series()[row];
        let qualities = store.quality().row(row);
        let operations = store.operations();
        let mut result = RowEvaluation {
            row,
            ..Default::default()
        };

        for (master, cols) in groups {
            let selected: Vec<usize> = cols
                .iter()
                .copied()
                .filter(|&c| self.config.mode.selects(qualities[c]))
                .collect();
            if selected.is_empty() {
                continue;
            }

            let evaluation = evaluate_master(series, master);
            result.evaluations += 1;
            match evaluation.bundle.as_ref() {
                ResultBundle::Failed(_) => result.failed += 1,
                ResultBundle::NotApplicable => result.not_applicable += 1,
                ResultBundle::Fields(_) => {}
            }

            let attributable = if evaluation.bundle.is_success() {
                evaluation.seconds()
            } else {
                0.0
            };
            result.master_seconds += attributable;

            for (k, &col) in selected.iter().enumerate() {
                let op = &operations[col];
                let (value, quality) = match extract(&evaluation.bundle, &op.transform) {
                    Ok(v) => (v, Quality::Good),
                    Err(e) => {
                        if evaluation.bundle.is_success() {
                            log::debug!(
                                "Operation {} ({}) on series {}: {}",
                                op.id,
                                op.name,
                                series.id,
                                e
                            );
                        }
                        (f64::NAN, e.quality())
                    }
                };
                result.cells.push(CellResult {
                    col,
                    value,
                    quality,
                    seconds: if k == 0 { attributable } else { 0.0 },
                    master_id: master.id,
                    bundle: Arc::clone(&evaluation.bundle),
                });
            }
        }

        result
    }

    /// 计算单行但不写回
    pub fn evaluate_row(&self, store: &ValueStore, row: usize) -> Result<RowEvaluation> {
        if row >= store.n_rows() {
            return Err(Error::InvalidConfig(format!(
                "row {} out of range (rows = {})",
                row,
                store.n_rows()
            )));
        }
        let groups = self.group_by_master(store.operations())?;
        Ok(self.evaluate_row_grouped(store, row, &groups))
    }

    /// 填充值矩阵
    ///
    /// 单元格级别的失败只影响质量码，不会中断循环。
    pub fn run(&self, store: &mut ValueStore) -> Result<BatchReport> {
        let start = Instant::now();
        let groups = self.group_by_master(store.operations())?;

        log::info!(
            "Batch compute: {} series x {} operations ({} masters), mode {:?}, parallel {}",
            store.n_rows(),
            store.n_cols(),
            groups.len(),
            self.config.mode,
            self.config.parallel
        );

        let rows: Vec<RowEvaluation> = if self.config.parallel {
            (0..store.n_rows())
                .into_par_iter()
                .map(|r| self.evaluate_row_grouped(store, r, &groups))
                .collect()
        } else {
            (0..store.n_rows())
                .map(|r| self.evaluate_row_grouped(store, r, &groups))
                .collect()
        };

        let mut report = BatchReport::default();
        for row in rows {
            report.series_processed += 1;
            report.master_evaluations += row.evaluations;
            report.failed_evaluations += row.failed;
            report.not_applicable_evaluations += row.not_applicable;
            report.master_seconds += row.master_seconds;

            for cell in row.cells {
                store.set_cell(row.row, cell.col, cell.value, cell.quality, cell.seconds);
                report.cells.add(cell.quality);
                metrics::record_cell(cell.quality);
            }
        }
        report.elapsed = start.elapsed();

        log::info!(
            "Batch compute done in {:?}: {} evaluations ({} failed, {} not applicable), cells good={} error={} n/a={}",
            report.elapsed,
            report.master_evaluations,
            report.failed_evaluations,
            report.not_applicable_evaluations,
            report.cells.good,
            report.cells.error,
            report.cells.not_applicable
        );

        Ok(report)
    }

    /// 填充快照；先检查快照的主运算元数据与注册表一致
    pub fn run_snapshot(&self, snapshot: &mut Snapshot) -> Result<BatchReport> {
        self.registry.check_bound(&snapshot.masters)?;
        snapshot.validate()?;
        self.run(&mut snapshot.store)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
