//! 矩阵整理流水线
//!
//! `curate` 消费一个快照并返回新快照，阶段严格有序：
//! 1. 子集选取
//! 2. 坏值规范化
//! 3. 行过滤
//! 4. 列过滤
//! 5. 退化列剔除
//! 6. 退化行剔除
//! 7. 归一化 (训练行拟合，全部行应用)
//! 8. 归一化后复核
//!
//! 任何阶段失败都直接返回错误，不产生部分结果。

use chrono::Utc;
use rayon::prelude::*;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use super::normalize::{ColumnNormParams, NormFunction};
use crate::observability::metrics;
use crate::store::{MasterInfo, Quality, Snapshot, ValueStore};
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 配置
// ═══════════════════════════════════════════════════════════════════════════

fn default_norm_function() -> String {
    "none".to_string()
}

fn default_row_thresh() -> f64 {
    0.7
}

fn default_col_thresh() -> f64 {
    1.0
}

/// 整理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    /// 归一化变换名，`none` 表示跳过
    #[serde(default = "default_norm_function")]
    pub norm_function: String,

    /// 行保留阈值：好值比例 `>= row_thresh` 的行保留
    #[serde(default = "default_row_thresh")]
    pub row_thresh: f64,

    /// 列保留阈值 (行过滤之后计算)
    #[serde(default = "default_col_thresh")]
    pub col_thresh: f64,

    /// 归一化参数拟合所用的时间序列 ID；缺省为全部行
    #[serde(default)]
    pub training_rows: Option<Vec<u64>>,

    /// 行下标子集
    #[serde(default)]
    pub row_subset: Option<Vec<usize>>,

    /// 列下标子集
    #[serde(default)]
    pub col_subset: Option<Vec<usize>>,

    /// 删除不再有依赖运算的主运算
    #[serde(default)]
    pub prune_orphan_masters: bool,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            norm_function: default_norm_function(),
            row_thresh: default_row_thresh(),
            col_thresh: default_col_thresh(),
            training_rows: None,
            row_subset: None,
            col_subset: None,
            prune_orphan_masters: false,
        }
    }
}

impl CurationConfig {
    pub fn with_norm(mut self, norm_function: impl Into<String>) -> Self {
        self.norm_function = norm_function.into();
        self
    }

    pub fn with_thresholds(mut self, row_thresh: f64, col_thresh: f64) -> Self {
        self.row_thresh = row_thresh;
        self.col_thresh = col_thresh;
        self
    }

    /// 检查阈值范围并解析归一化变换名
    pub fn validate(&self) -> Result<NormFunction> {
        for (name, t) in [("row_thresh", self.row_thresh), ("col_thresh", self.col_thresh)] {
            if !(0.0..=1.0).contains(&t) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, t
                )));
            }
        }
        NormFunction::parse(&self.norm_function)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 报告
// ═══════════════════════════════════════════════════════════════════════════

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationStage {
    Subset,
    Canonicalize,
    RowFilter,
    ColumnFilter,
    DegenerateColumns,
    DegenerateRows,
    Normalize,
    Revalidate,
}

impl CurationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CurationStage::Subset => "subset",
            CurationStage::Canonicalize => "canonicalize",
            CurationStage::RowFilter => "row_filter",
            CurationStage::ColumnFilter => "column_filter",
            CurationStage::DegenerateColumns => "degenerate_columns",
            CurationStage::DegenerateRows => "degenerate_rows",
            CurationStage::Normalize => "normalize",
            CurationStage::Revalidate => "revalidate",
        }
    }
}

impl fmt::Display for CurationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单阶段统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: CurationStage,
    pub rows_removed: usize,
    pub cols_removed: usize,
    /// 被改写为 Error 的单元格数
    pub cells_recoded: usize,
    pub skipped: bool,
    /// 阶段结束后的形状
    pub shape: (usize, usize),
}

/// 整理报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurationReport {
    pub input_shape: (usize, usize),
    pub output_shape: (usize, usize),
    pub norm_function: String,
    pub stages: Vec<StageReport>,
    pub masters_pruned: usize,
    pub elapsed_ms: u64,
}

impl CurationReport {
    pub fn stage(&self, stage: CurationStage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn rows_removed(&self) -> usize {
        self.stages.iter().map(|s| s.rows_removed).sum()
    }

    pub fn cols_removed(&self) -> usize {
        self.stages.iter().map(|s| s.cols_removed).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn push(&mut self, stage: StageReport) {
        log::info!(
            "Curation [{}]{}: -{} rows, -{} columns, {} cells recoded -> {}x{}",
            stage.stage,
            if stage.skipped { " (skipped)" } else { "" },
            stage.rows_removed,
            stage.cols_removed,
            stage.cells_recoded,
            stage.shape.0,
            stage.shape.1
        );
        metrics::record_curation_removed(stage.stage.as_str(), "rows", stage.rows_removed);
        metrics::record_curation_removed(stage.stage.as_str(), "columns", stage.cols_removed);
        self.stages.push(stage);
    }
}

/// 归一化信息，随整理后的快照一起保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct NormalizationInfo {
    pub norm_function: String,
    pub row_thresh: f64,
    pub col_thresh: f64,
    pub training_rows: Option<Vec<u64>>,
    pub prune_orphan_masters: bool,
    /// 每个保留列的拟合参数 (`none` 时为空)
    pub column_params: Vec<ColumnNormParams>,
}

impl NormalizationInfo {
    pub fn function(&self) -> Result<NormFunction> {
        NormFunction::parse(&self.norm_function)
    }
}

/// 整理结果
#[derive(Debug, Clone)]
pub struct CurationOutcome {
    pub snapshot: Snapshot,
    pub report: CurationReport,
}

// ═══════════════════════════════════════════════════════════════════════════
// 辅助函数
// ═══════════════════════════════════════════════════════════════════════════

/// 退化判定：至少两个有限值，且极差小于机器精度。
///
/// 有限值不足两个的向量不算常数；全 NaN 列留给复核阶段剔除。
fn is_degenerate<I: IntoIterator<Item = f64>>(values: I) -> bool {
    let (mut lo, mut hi, mut n) = (f64::INFINITY, f64::NEG_INFINITY, 0usize);
    for x in values.into_iter().filter(|x| x.is_finite()) {
        lo = lo.min(x);
        hi = hi.max(x);
        n += 1;
    }
    n >= 2 && hi - lo < f64::EPSILON
}

fn good_fraction(qualities: impl Iterator<Item = Quality>, n: usize) -> f64 {
    qualities.filter(|q| q.is_good()).count() as f64 / n as f64
}

/// 非 Good 单元格置 NaN；Good 但非有限的单元格改为 Error。返回改写数。
fn canonicalize(store: &mut ValueStore) -> usize {
    let (values, quality) = store.matrices_mut();
    let (rows, cols) = values.shape();
    let mut recoded = 0;
    for r in 0..rows {
        let vals = values.row_mut(r);
        let quals = quality.row_mut(r);
        for c in 0..cols {
            if quals[c].is_good() {
                if !vals[c].is_finite() {
                    quals[c] = Quality::Error;
                    vals[c] = f64::NAN;
                    recoded += 1;
                }
            } else {
                vals[c] = f64::NAN;
            }
        }
    }
    recoded
}

fn stage_report(stage: CurationStage, store: &ValueStore) -> StageReport {
    StageReport {
        stage,
        rows_removed: 0,
        cols_removed: 0,
        cells_recoded: 0,
        skipped: false,
        shape: store.shape(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 各阶段
// ═══════════════════════════════════════════════════════════════════════════

fn stage_subset(store: ValueStore, config: &CurationConfig) -> Result<(ValueStore, StageReport)> {
    if config.row_subset.is_none() && config.col_subset.is_none() {
        let mut report = stage_report(CurationStage::Subset, &store);
        report.skipped = true;
        return Ok((store, report));
    }

    let (before_rows, before_cols) = store.shape();
    let rows: Vec<usize> = config
        .row_subset
        .clone()
        .unwrap_or_else(|| (0..before_rows).collect());
    let cols: Vec<usize> = config
        .col_subset
        .clone()
        .unwrap_or_else(|| (0..before_cols).collect());
    let subset = store.select(&rows, &cols)?;

    let mut report = stage_report(CurationStage::Subset, &subset);
    report.rows_removed = before_rows.saturating_sub(subset.n_rows());
    report.cols_removed = before_cols.saturating_sub(subset.n_cols());
    Ok((subset, report))
}

fn stage_row_filter(store: &mut ValueStore, thresh: f64) -> Result<StageReport> {
    let n_cols = store.n_cols();
    let keep: Vec<bool> = (0..store.n_rows())
        .map(|r| good_fraction(store.quality().row(r).iter().copied(), n_cols) >= thresh)
        .collect();
    let removed = store.retain_rows(&keep)?;
    if store.n_rows() == 0 {
        return Err(Error::AllRowsFiltered { threshold: thresh });
    }
    let mut report = stage_report(CurationStage::RowFilter, store);
    report.rows_removed = removed;
    Ok(report)
}

fn stage_column_filter(store: &mut ValueStore, thresh: f64) -> Result<StageReport> {
    let n_rows = store.n_rows();
    let quality = store.quality();
    let keep: Vec<bool> = (0..store.n_cols())
        .map(|c| good_fraction((0..n_rows).map(|r| quality.get(r, c)), n_rows) >= thresh)
        .collect();
    let removed = store.retain_columns(&keep)?;
    if store.n_cols() == 0 {
        return Err(Error::AllColumnsFiltered { threshold: thresh });
    }
    let mut report = stage_report(CurationStage::ColumnFilter, store);
    report.cols_removed = removed;
    Ok(report)
}

fn degenerate_columns(store: &ValueStore) -> Vec<bool> {
    let values = store.values();
    (0..store.n_cols())
        .map(|c| !is_degenerate((0..store.n_rows()).map(|r| values.get(r, c))))
        .collect()
}

fn stage_degenerate_columns(store: &mut ValueStore, col_thresh: f64) -> Result<StageReport> {
    if store.n_rows() < 2 {
        let mut report = stage_report(CurationStage::DegenerateColumns, store);
        report.skipped = true;
        return Ok(report);
    }
    let keep = degenerate_columns(store);
    let removed = store.retain_columns(&keep)?;
    if store.n_cols() == 0 {
        return Err(Error::AllColumnsFiltered {
            threshold: col_thresh,
        });
    }
    let mut report = stage_report(CurationStage::DegenerateColumns, store);
    report.cols_removed = removed;
    Ok(report)
}

fn stage_degenerate_rows(store: &mut ValueStore, row_thresh: f64) -> Result<StageReport> {
    if store.n_cols() < 2 || store.n_rows() < 2 {
        let mut report = stage_report(CurationStage::DegenerateRows, store);
        report.skipped = true;
        return Ok(report);
    }
    let keep: Vec<bool> = (0..store.n_rows())
        .map(|r| !is_degenerate(store.values().row(r).iter().copied()))
        .collect();
    let removed = store.retain_rows(&keep)?;
    if store.n_rows() == 0 {
        return Err(Error::AllRowsFiltered {
            threshold: row_thresh,
        });
    }
    let mut report = stage_report(CurationStage::DegenerateRows, store);
    report.rows_removed = removed;
    Ok(report)
}

/// 训练行 ID → 当前行下标；ID 必须出现在子集之后的矩阵中
fn training_indices(store: &ValueStore, training: Option<&[u64]>) -> Result<Vec<usize>> {
    let Some(ids) = training else {
        return Ok((0..store.n_rows()).collect());
    };
    let wanted: HashSet<u64> = ids.iter().copied().collect();
    let rows: Vec<usize> = store
        .time_series()
        .iter()
        .enumerate()
        .filter(|(_, ts)| wanted.contains(&ts.id))
        .map(|(r, _)| r)
        .collect();
    if rows.is_empty() {
        return Err(Error::InvalidConfig(
            "no training rows survive filtering".to_string(),
        ));
    }
    Ok(rows)
}

fn stage_normalize(
    store: &mut ValueStore,
    norm: NormFunction,
    training: &[usize],
) -> (StageReport, Vec<ColumnNormParams>) {
    let mut report = stage_report(CurationStage::Normalize, store);
    if norm.is_identity() {
        log::info!("Normalization 'none': values left unchanged");
        report.skipped = true;
        return (report, Vec::new());
    }

    let values = store.values();
    let params: Vec<ColumnNormParams> = store
        .operations()
        .par_iter()
        .enumerate()
        .map(|(c, op)| {
            let column: Vec<f64> = training.iter().map(|&r| values.get(r, c)).collect();
            ColumnNormParams {
                op_id: op.id,
                params: norm.fit(&column),
            }
        })
        .collect();

    let (values, quality) = store.matrices_mut();
    for r in 0..values.rows() {
        let vals = values.row_mut(r);
        let quals = quality.row(r);
        for (c, p) in params.iter().enumerate() {
            if quals[c].is_good() {
                vals[c] = norm.apply(vals[c], &p.params);
            }
        }
    }

    log::info!(
        "Normalization '{}' fitted on {} training rows, applied to {} rows",
        norm,
        training.len(),
        store.n_rows()
    );
    (report, params)
}

fn stage_revalidate(store: &mut ValueStore) -> Result<StageReport> {
    let recoded = canonicalize(store);
    let check_range = store.n_rows() >= 2;
    let values = store.values();
    let keep: Vec<bool> = (0..store.n_cols())
        .map(|c| {
            let column = values.column(c);
            column.iter().any(|x| x.is_finite())
                && !(check_range && is_degenerate(column.iter().copied()))
        })
        .collect();
    let removed = store.retain_columns(&keep)?;
    if store.n_cols() == 0 {
        return Err(Error::NoGoodValuesAfterNormalization(format!(
            "all {} columns are empty or constant after normalization",
            removed
        )));
    }
    let mut report = stage_report(CurationStage::Revalidate, store);
    report.cols_removed = removed;
    report.cells_recoded = recoded;
    Ok(report)
}

fn prune_orphans(masters: Vec<MasterInfo>, store: &ValueStore) -> (Vec<MasterInfo>, usize) {
    let used: HashSet<u64> = store.operations().iter().map(|op| op.master_id).collect();
    let before = masters.len();
    let kept: Vec<MasterInfo> = masters.into_iter().filter(|m| used.contains(&m.id)).collect();
    let pruned = before - kept.len();
    (kept, pruned)
}

// ═══════════════════════════════════════════════════════════════════════════
// 入口
// ═══════════════════════════════════════════════════════════════════════════

/// 整理快照
pub fn curate(snapshot: Snapshot, config: &CurationConfig) -> Result<CurationOutcome> {
    let start = Instant::now();
    let norm = config.validate()?;
    snapshot.validate()?;

    let Snapshot { store, masters, .. } = snapshot;
    let mut report = CurationReport {
        input_shape: store.shape(),
        norm_function: norm.name().to_string(),
        ..Default::default()
    };
    log::info!(
        "Curating {}x{} matrix: row_thresh={}, col_thresh={}, norm={}",
        report.input_shape.0,
        report.input_shape.1,
        config.row_thresh,
        config.col_thresh,
        norm
    );

    // 1. 子集
    let (mut store, subset) = stage_subset(store, config)?;
    report.push(subset);
    if store.n_rows() == 0 {
        return Err(Error::AllRowsFiltered {
            threshold: config.row_thresh,
        });
    }
    if store.n_cols() == 0 {
        return Err(Error::AllColumnsFiltered {
            threshold: config.col_thresh,
        });
    }
    // 训练行在子集之后即可校验，尽早失败
    if let Some(ids) = &config.training_rows {
        if let Some(missing) = ids.iter().find(|id| store.row_of(**id).is_none()) {
            return Err(Error::InvalidConfig(format!(
                "training series id {} not in the matrix",
                missing
            )));
        }
    }

    // 2. 坏值规范化
    let mut canon = stage_report(CurationStage::Canonicalize, &store);
    canon.cells_recoded = canonicalize(&mut store);
    report.push(canon);

    // 3-6. 过滤
    report.push(stage_row_filter(&mut store, config.row_thresh)?);
    report.push(stage_column_filter(&mut store, config.col_thresh)?);
    report.push(stage_degenerate_columns(&mut store, config.col_thresh)?);
    report.push(stage_degenerate_rows(&mut store, config.row_thresh)?);

    // 7. 归一化
    let training = training_indices(&store, config.training_rows.as_deref())?;
    let (normalize, mut column_params) = stage_normalize(&mut store, norm, &training);
    report.push(normalize);

    // 8. 复核
    report.push(stage_revalidate(&mut store)?);
    if !column_params.is_empty() {
        let kept: HashSet<u64> = store.operations().iter().map(|op| op.id).collect();
        column_params.retain(|p| kept.contains(&p.op_id));
    }

    let masters = if config.prune_orphan_masters {
        let (kept, pruned) = prune_orphans(masters, &store);
        report.masters_pruned = pruned;
        kept
    } else {
        masters
    };

    report.output_shape = store.shape();
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    log::info!(
        "Curation done in {}ms: {}x{} -> {}x{}",
        report.elapsed_ms,
        report.input_shape.0,
        report.input_shape.1,
        report.output_shape.0,
        report.output_shape.1
    );

    let snapshot = Snapshot {
        store,
        masters,
        normalization: Some(NormalizationInfo {
            norm_function: norm.name().to_string(),
            row_thresh: config.row_thresh,
            col_thresh: config.col_thresh,
            training_rows: config.training_rows.clone(),
            prune_orphan_masters: config.prune_orphan_masters,
            column_params,
        }),
        created_at: Utc::now(),
    };
    Ok(CurationOutcome { snapshot, report })
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
