//! 值矩阵存储
//!
//! 三张形状为 `[序列数 × 运算数]` 的并行矩阵：
//! - `values`: 特征值 (NaN = 未设置/无效)
//! - `quality`: 质量码
//! - `calc_time`: 计算耗时 (秒)
//!
//! 行 ↔ 时间序列，列 ↔ 指针运算。任何行列删除都同时作用于三张矩阵与两张元数据表。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::compute::resolver::Transform;
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 元数据
// ═══════════════════════════════════════════════════════════════════════════

/// 时间序列 (入库后不可变)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub id: u64,
    pub name: String,
    pub keywords: Vec<String>,
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn new(id: u64, name: impl Into<String>, data: Vec<f64>) -> Self {
        Self {
            id,
            name: name.into(),
            keywords: Vec::new(),
            data,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }
}

/// 指针运算：从某个主运算的结果包中提取一个标量
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: u64,
    pub name: String,
    pub keywords: Vec<String>,
    /// 依赖的主运算 ID
    pub master_id: u64,
    /// 加载时解析好的提取规则
    pub transform: Transform,
}

impl Operation {
    /// 解析提取规则 (如 `ac[1]`, `mean|abs`) 并创建运算
    pub fn new(
        id: u64,
        name: impl Into<String>,
        master_id: u64,
        transform_code: &str,
    ) -> Result<Self> {
        Ok(Self {
            id,
            name: name.into(),
            keywords: Vec::new(),
            master_id,
            transform: Transform::parse(transform_code)?,
        })
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 质量码
// ═══════════════════════════════════════════════════════════════════════════

/// 单元格质量码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Quality {
    /// 值可信
    Good = 0,
    /// 主运算失败或提取失败
    Error = 1,
    /// 主运算对该序列无输出 (正常情况，非错误)
    NotApplicable = 2,
    /// 尚未计算
    NotComputed = 3,
}

impl Quality {
    pub const ALL: [Quality; 4] = [
        Quality::Good,
        Quality::Error,
        Quality::NotApplicable,
        Quality::NotComputed,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Quality::Good),
            1 => Some(Quality::Error),
            2 => Some(Quality::NotApplicable),
            3 => Some(Quality::NotComputed),
            _ => None,
        }
    }

    pub fn is_good(self) -> bool {
        self == Quality::Good
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Error => "error",
            Quality::NotApplicable => "not_applicable",
            Quality::NotComputed => "not_computed",
        }
    }
}

/// 各质量码的单元格计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCounts {
    pub good: usize,
    pub error: usize,
    pub not_applicable: usize,
    pub not_computed: usize,
}

impl QualityCounts {
    pub fn add(&mut self, quality: Quality) {
        match quality {
            Quality::Good => self.good += 1,
            Quality::Error => self.error += 1,
            Quality::NotApplicable => self.not_applicable += 1,
            Quality::NotComputed => self.not_computed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.good + self.error + self.not_applicable + self.not_computed
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 行主序矩阵
// ═══════════════════════════════════════════════════════════════════════════

/// 行主序稠密矩阵
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::ShapeMismatch(format!(
                "{} elements for a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> Vec<T> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    fn retain_rows(&mut self, keep: &[bool]) {
        let cols = self.cols;
        let mut data = Vec::with_capacity(self.data.len());
        for (r, _) in keep.iter().enumerate().filter(|(_, k)| **k) {
            data.extend_from_slice(&self.data[r * cols..(r + 1) * cols]);
        }
        self.rows = keep.iter().filter(|k| **k).count();
        self.data = data;
    }

    fn retain_columns(&mut self, keep: &[bool]) {
        let new_cols = keep.iter().filter(|k| **k).count();
        let mut data = Vec::with_capacity(self.rows * new_cols);
        for r in 0..self.rows {
            let row = self.row(r);
            data.extend(
                row.iter()
                    .zip(keep)
                    .filter(|(_, k)| **k)
                    .map(|(v, _)| *v),
            );
        }
        self.cols = new_cols;
        self.data = data;
    }

    fn select(&self, rows: &[usize], cols: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * cols.len());
        for &r in rows {
            for &c in cols {
                data.push(self.get(r, c));
            }
        }
        Self {
            rows: rows.len(),
            cols: cols.len(),
            data,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 值矩阵存储
// ═══════════════════════════════════════════════════════════════════════════

/// 值矩阵存储：三张并行矩阵 + 行 (时间序列) / 列 (运算) 元数据
#[derive(Debug, Clone)]
pub struct ValueStore {
    time_series: Vec<TimeSeries>,
    operations: Vec<Operation>,
    values: Matrix<f64>,
    quality: Matrix<Quality>,
    calc_time: Matrix<f64>,
}

impl ValueStore {
    /// 创建空白存储：值 NaN、质量 NotComputed、耗时 NaN
    pub fn new(time_series: Vec<TimeSeries>, operations: Vec<Operation>) -> Self {
        let (rows, cols) = (time_series.len(), operations.len());
        Self {
            time_series,
            operations,
            values: Matrix::filled(rows, cols, f64::NAN),
            quality: Matrix::filled(rows, cols, Quality::NotComputed),
            calc_time: Matrix::filled(rows, cols, f64::NAN),
        }
    }

    /// 从已有矩阵组装 (如快照加载)，检查形状一致性
    pub fn from_parts(
        time_series: Vec<TimeSeries>,
        operations: Vec<Operation>,
        values: Matrix<f64>,
        quality: Matrix<Quality>,
        calc_time: Matrix<f64>,
    ) -> Result<Self> {
        let store = Self {
            time_series,
            operations,
            values,
            quality,
            calc_time,
        };
        store.check_consistency()?;
        Ok(store)
    }

    /// 检查三张矩阵与元数据的形状是否一致，以及 ID 是否唯一
    pub fn check_consistency(&self) -> Result<()> {
        let expected = (self.time_series.len(), self.operations.len());
        for (name, shape) in [
            ("values", self.values.shape()),
            ("quality", self.quality.shape()),
            ("calc_time", self.calc_time.shape()),
        ] {
            if shape != expected {
                return Err(Error::ShapeMismatch(format!(
                    "{} is {}x{}, metadata is {}x{}",
                    name, shape.0, shape.1, expected.0, expected.1
                )));
            }
        }

        let mut seen = HashSet::new();
        if let Some(ts) = self.time_series.iter().find(|ts| !seen.insert(ts.id)) {
            return Err(Error::ShapeMismatch(format!(
                "duplicate time series id {}",
                ts.id
            )));
        }
        seen.clear();
        if let Some(op) = self.operations.iter().find(|op| !seen.insert(op.id)) {
            return Err(Error::ShapeMismatch(format!(
                "duplicate operation id {}",
                op.id
            )));
        }
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.time_series.len()
    }

    pub fn n_cols(&self) -> usize {
        self.operations.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows(), self.n_cols())
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0 || self.n_cols() == 0
    }

    pub fn time_series(&self) -> &[TimeSeries] {
        &self.time_series
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn values(&self) -> &Matrix<f64> {
        &self.values
    }

    pub fn quality(&self) -> &Matrix<Quality> {
        &self.quality
    }

    pub fn calc_time(&self) -> &Matrix<f64> {
        &self.calc_time
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values.get(row, col)
    }

    pub fn quality_at(&self, row: usize, col: usize) -> Quality {
        self.quality.get(row, col)
    }

    pub fn calc_time_at(&self, row: usize, col: usize) -> f64 {
        self.calc_time.get(row, col)
    }

    /// 写入一个单元格；非 Good 质量强制值为 NaN
    pub fn set_cell(&mut self, row: usize, col: usize, value: f64, quality: Quality, seconds: f64) {
        let value = if quality.is_good() { value } else { f64::NAN };
        self.values.set(row, col, value);
        self.quality.set(row, col, quality);
        self.calc_time.set(row, col, seconds);
    }

    pub(crate) fn matrices_mut(&mut self) -> (&mut Matrix<f64>, &mut Matrix<Quality>) {
        (&mut self.values, &mut self.quality)
    }

    /// 按时间序列 ID 查找行号
    pub fn row_of(&self, ts_id: u64) -> Option<usize> {
        self.time_series.iter().position(|ts| ts.id == ts_id)
    }

    /// 按运算 ID 查找列号
    pub fn column_of(&self, op_id: u64) -> Option<usize> {
        self.operations.iter().position(|op| op.id == op_id)
    }

    pub fn rows_with_keyword(&self, keyword: &str) -> Vec<usize> {
        self.time_series
            .iter()
            .enumerate()
            .filter(|(_, ts)| ts.has_keyword(keyword))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn columns_with_keyword(&self, keyword: &str) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.has_keyword(keyword))
            .map(|(i, _)| i)
            .collect()
    }

    /// 保留 `keep[i] == true` 的行，同步作用于三张矩阵与序列元数据。返回删除行数。
    pub fn retain_rows(&mut self, keep: &[bool]) -> Result<usize> {
        if keep.len() != self.n_rows() {
            return Err(Error::ShapeMismatch(format!(
                "row mask has {} entries, store has {} rows",
                keep.len(),
                self.n_rows()
            )));
        }
        let before = self.n_rows();
        self.values.retain_rows(keep);
        self.quality.retain_rows(keep);
        self.calc_time.retain_rows(keep);
        let mut flags = keep.iter();
        self.time_series
            .retain(|_| flags.next().copied().unwrap_or(false));
        Ok(before - self.n_rows())
    }

    /// 保留 `keep[j] == true` 的列，同步作用于三张矩阵与运算元数据。返回删除列数。
    pub fn retain_columns(&mut self, keep: &[bool]) -> Result<usize> {
        if keep.len() != self.n_cols() {
            return Err(Error::ShapeMismatch(format!(
                "column mask has {} entries, store has {} columns",
                keep.len(),
                self.n_cols()
            )));
        }
        let before = self.n_cols();
        self.values.retain_columns(keep);
        self.quality.retain_columns(keep);
        self.calc_time.retain_columns(keep);
        let mut flags = keep.iter();
        self.operations
            .retain(|_| flags.next().copied().unwrap_or(false));
        Ok(before - self.n_cols())
    }

    /// 按行列下标取子集 (保持给定顺序)
    pub fn select(&self, rows: &[usize], cols: &[usize]) -> Result<Self> {
        if let Some(r) = rows.iter().find(|&&r| r >= self.n_rows()) {
            return Err(Error::InvalidConfig(format!(
                "row index {} out of range (rows = {})",
                r,
                self.n_rows()
            )));
        }
        if let Some(c) = cols.iter().find(|&&c| c >= self.n_cols()) {
            return Err(Error::InvalidConfig(format!(
                "column index {} out of range (columns = {})",
                c,
                self.n_cols()
            )));
        }
        let store = Self {
            time_series: rows.iter().map(|&r| self.time_series[r].clone()).collect(),
            operations: cols.iter().map(|&c| self.operations[c].clone()).collect(),
            values: self.values.select(rows, cols),
            quality: self.quality.select(rows, cols),
            calc_time: self.calc_time.select(rows, cols),
        };
        store.check_consistency()?;
        Ok(store)
    }

    pub fn quality_counts(&self) -> QualityCounts {
        let mut counts = QualityCounts::default();
        for q in self.quality.as_slice() {
            counts.add(*q);
        }
        counts
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<TimeSeries>,
        Vec<Operation>,
        Matrix<f64>,
        Matrix<Quality>,
        Matrix<f64>,
    ) {
        (
            self.time_series,
            self.operations,
            self.values,
            self.quality,
            self.calc_time,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> ValueStore {
        let ts = (0..3)
            .map(|i| TimeSeries::new(i + 1, format!("ts{}", i + 1), vec![i as f64; 4]))
            .collect();
        let ops = (0..3)
            .map(|j| Operation::new(10 + j, format!("op{}", j), 1, "mean").unwrap())
            .collect();
        let mut store = ValueStore::new(ts, ops);
        for r in 0..3 {
            for c in 0..3 {
                store.set_cell(r, c, (r * 10 + c) as f64, Quality::Good, 0.5);
            }
        }
        store
    }

    #[test]
    fn test_new_store_is_not_computed() {
        let store = ValueStore::new(
            vec![TimeSeries::new(1, "a", vec![1.0])],
            vec![Operation::new(1, "op", 1, "x").unwrap()],
        );
        assert_eq!(store.shape(), (1, 1));
        assert!(store.value(0, 0).is_nan());
        assert_eq!(store.quality_at(0, 0), Quality::NotComputed);
        assert_eq!(store.quality_counts().not_computed, 1);
    }

    #[test]
    fn test_set_cell_forces_nan_for_bad_quality() {
        let mut store = sample_store();
        store.set_cell(1, 1, 42.0, Quality::Error, 0.0);
        assert!(store.value(1, 1).is_nan());
        assert_eq!(store.quality_at(1, 1), Quality::Error);
    }

    #[test]
    fn test_retain_rows_keeps_everything_aligned() {
        let mut store = sample_store();
        let removed = store.retain_rows(&[true, false, true]).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.shape(), (2, 3));
        assert_eq!(store.time_series()[1].id, 3);
        assert_eq!(store.value(1, 2), 22.0);
        assert_eq!(store.calc_time().rows(), 2);
        store.check_consistency().unwrap();
    }

    #[test]
    fn test_retain_columns_keeps_everything_aligned() {
        let mut store = sample_store();
        let removed = store.retain_columns(&[false, true, true]).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.shape(), (3, 2));
        assert_eq!(store.operations()[0].id, 11);
        assert_eq!(store.value(2, 0), 21.0);
        assert_eq!(store.quality().cols(), 2);
        store.check_consistency().unwrap();
    }

    #[test]
    fn test_mask_length_mismatch_is_rejected() {
        let mut store = sample_store();
        assert!(store.retain_rows(&[true]).is_err());
        assert!(store.retain_columns(&[true, true]).is_err());
        assert_eq!(store.shape(), (3, 3));
    }

    #[test]
    fn test_select_subset() {
        let store = sample_store();
        let sub = store.select(&[2, 0], &[1]).unwrap();
        assert_eq!(sub.shape(), (2, 1));
        assert_eq!(sub.value(0, 0), 21.0);
        assert_eq!(sub.value(1, 0), 1.0);
        assert!(store.select(&[5], &[0]).is_err());
    }

    #[test]
    fn test_from_parts_detects_shape_mismatch() {
        let result = ValueStore::from_parts(
            vec![TimeSeries::new(1, "a", vec![1.0])],
            vec![],
            Matrix::filled(1, 1, 0.0),
            Matrix::filled(1, 0, Quality::Good),
            Matrix::filled(1, 0, 0.0),
        );
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_keyword_lookup() {
        let store = ValueStore::new(
            vec![
                TimeSeries::new(1, "a", vec![1.0]).with_keywords(["ecg"]),
                TimeSeries::new(2, "b", vec![1.0]).with_keywords(["eeg", "noisy"]),
            ],
            vec![Operation::new(1, "op", 1, "x").unwrap().with_keywords(["corr"])],
        );
        assert_eq!(store.rows_with_keyword("noisy"), vec![1]);
        assert_eq!(store.columns_with_keyword("corr"), vec![0]);
        assert_eq!(store.row_of(2), Some(1));
        assert_eq!(store.column_of(9), None);
    }

    #[test]
    fn test_quality_code_round_trip() {
        for q in Quality::ALL {
            assert_eq!(Quality::from_code(q.code()), Some(q));
        }
        assert_eq!(Quality::from_code(9), None);
    }
}
