//! 标准主运算
//!
//! 少量内置的参考特征算法，完整的特征算法库属于外部协作方：
//! - `moments` - 分布矩 (Welford)
//! - `autocorr` - 自相关函数
//! - `extremes` - 极值
//! - `spectrum` - 离散傅里叶变换

pub mod welford;

pub use welford::*;

use std::f64::consts::PI;
use std::sync::Arc;

use super::master::{ComputeError, FieldValue, MasterOperation, MasterRegistry, ResultBundle};
use crate::store::Operation;
use crate::Result;

type ComputeResult = std::result::Result<ResultBundle, ComputeError>;

fn ensure_finite(data: &[f64]) -> std::result::Result<(), ComputeError> {
    match data.iter().position(|x| !x.is_finite()) {
        Some(i) => Err(ComputeError::InvalidInput(format!(
            "non-finite sample at index {}",
            i
        ))),
        None => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 主运算实现
// ═══════════════════════════════════════════════════════════════════════════

/// 分布矩：mean / std / skewness / kurtosis / n
#[derive(Debug, Clone, Copy, Default)]
pub struct Moments;

impl Moments {
    pub const MIN_LENGTH: usize = 3;

    fn compute(&self, data: &[f64]) -> ComputeResult {
        if data.len() < Self::MIN_LENGTH {
            return Ok(ResultBundle::NotApplicable);
        }
        ensure_finite(data)?;

        let state = WelfordState::from_finite(data);
        Ok(ResultBundle::from_fields([
            ("mean", FieldValue::Scalar(state.mean)),
            ("std", FieldValue::Scalar(state.sample_std())),
            ("skewness", FieldValue::Scalar(state.skewness())),
            ("kurtosis", FieldValue::Scalar(state.kurtosis())),
            ("n", FieldValue::Scalar(state.count as f64)),
        ]))
    }
}

/// 自相关：`acf[k]` 为滞后 k 的自相关 (acf[0] = 1)，`first_zero` 为首个非正滞后
#[derive(Debug, Clone, Copy)]
pub struct Autocorrelation {
    pub max_lag: usize,
}

impl Default for Autocorrelation {
    fn default() -> Self {
        Self { max_lag: 10 }
    }
}

impl Autocorrelation {
    fn compute(&self, data: &[f64]) -> ComputeResult {
        if data.len() < 3 {
            return Ok(ResultBundle::NotApplicable);
        }
        ensure_finite(data)?;

        let n = data.len();
        let mean = data.iter().sum::<f64>() / n as f64;
        let denom: f64 = data.iter().map(|x| (x - mean) * (x - mean)).sum();
        if denom == 0.0 {
            return Err(ComputeError::Numeric(
                "zero variance, autocorrelation undefined".to_string(),
            ));
        }

        let max_lag = self.max_lag.min(n - 1);
        let acf: Vec<f64> = (0..=max_lag)
            .map(|k| {
                let num: f64 = (0..n - k)
                    .map(|t| (data[t] - mean) * (data[t + k] - mean))
                    .sum();
                num / denom
            })
            .collect();

        let first_zero = acf
            .iter()
            .position(|r| *r <= 0.0)
            .unwrap_or(acf.len()) as f64;

        Ok(ResultBundle::from_fields([
            ("acf", FieldValue::Array(acf)),
            ("first_zero", FieldValue::Scalar(first_zero)),
        ]))
    }
}

/// 极值：min / max / range / argmax (相对位置 0..1)
#[derive(Debug, Clone, Copy, Default)]
pub struct Extremes;

impl Extremes {
    fn compute(&self, data: &[f64]) -> ComputeResult {
        ensure_finite(data)?;

        let (mut min, mut max, mut argmax) = (f64::INFINITY, f64::NEG_INFINITY, 0usize);
        for (i, &x) in data.iter().enumerate() {
            min = min.min(x);
            if x > max {
                max = x;
                argmax = i;
            }
        }
        let argmax_frac = if data.len() > 1 {
            argmax as f64 / (data.len() - 1) as f64
        } else {
            0.0
        };

        Ok(ResultBundle::from_fields([
            ("min", FieldValue::Scalar(min)),
            ("max", FieldValue::Scalar(max)),
            ("range", FieldValue::Scalar(max - min)),
            ("argmax", FieldValue::Scalar(argmax_frac)),
        ]))
    }
}

/// 频谱：`dft1` 第一个频点的复系数，`power` 为 1..=n/2 频点的功率
#[derive(Debug, Clone, Copy, Default)]
pub struct Spectrum;

impl Spectrum {
    pub const MIN_LENGTH: usize = 4;

    fn dft(data: &[f64], k: usize) -> (f64, f64) {
        let n = data.len() as f64;
        data.iter().enumerate().fold((0.0, 0.0), |(re, im), (t, &x)| {
            let angle = -2.0 * PI * (k as f64) * (t as f64) / n;
            (re + x * angle.cos(), im + x * angle.sin())
        })
    }

    fn compute(&self, data: &[f64]) -> ComputeResult {
        if data.len() < Self::MIN_LENGTH {
            return Ok(ResultBundle::NotApplicable);
        }
        ensure_finite(data)?;

        let (re, im) = Self::dft(data, 1);
        let power: Vec<f64> = (1..=data.len() / 2)
            .map(|k| {
                let (r, i) = Self::dft(data, k);
                r * r + i * i
            })
            .collect();

        Ok(ResultBundle::from_fields([
            ("dft1", FieldValue::Complex { re, im }),
            ("power", FieldValue::Array(power)),
        ]))
    }
}

macro_rules! impl_master_computation {
    ($($ty:ty),*) => {
        $(
            impl super::master::MasterComputation for $ty {
                fn compute(&self, data: &[f64]) -> ComputeResult {
                    <$ty>::compute(self, data)
                }
            }
        )*
    };
}

impl_master_computation!(Moments, Autocorrelation, Extremes, Spectrum);

// ═══════════════════════════════════════════════════════════════════════════
// 标准注册表
// ═══════════════════════════════════════════════════════════════════════════

/// 标准主运算表 (id, label)
pub const STANDARD_MASTERS: [(u64, &str); 4] = [
    (1, "moments"),
    (2, "autocorr"),
    (3, "extremes"),
    (4, "spectrum"),
];

pub(crate) fn standard_registry() -> MasterRegistry {
    let mut registry = MasterRegistry::new();
    registry.insert(MasterOperation::new(1, "moments", Arc::new(Moments)));
    registry.insert(MasterOperation::new(
        2,
        "autocorr",
        Arc::new(Autocorrelation::default()),
    ));
    registry.insert(MasterOperation::new(3, "extremes", Arc::new(Extremes)));
    registry.insert(MasterOperation::new(4, "spectrum", Arc::new(Spectrum)));
    registry
}

/// 标准指针运算 (id, name, code)
pub const STANDARD_OPERATIONS: &[(u64, &str, &str)] = &[
    (1, "DN_Mean", "moments.mean"),
    (2, "DN_Std", "moments.std"),
    (3, "DN_Skewness", "moments.skewness"),
    (4, "DN_Kurtosis", "moments.kurtosis"),
    (5, "CO_AutoCorr_1", "autocorr.acf[1]"),
    (6, "CO_AutoCorr_2", "autocorr.acf[2]"),
    (7, "CO_AutoCorr_3", "autocorr.acf[3]"),
    (8, "CO_FirstZero", "autocorr.first_zero"),
    (9, "CO_AutoCorr_Mean", "autocorr.acf|mean"),
    (10, "DN_Min", "extremes.min"),
    (11, "DN_Max", "extremes.max"),
    (12, "DN_Range", "extremes.range"),
    (13, "DN_ArgMax", "extremes.argmax"),
    (14, "SP_Dft1_Abs", "spectrum.dft1|modulus"),
    (15, "SP_Dft1_Real", "spectrum.dft1|real"),
    (16, "SP_PowerMax", "spectrum.power|max"),
    (17, "SP_PowerTotal", "spectrum.power|sum"),
];

/// 基于注册表创建标准指针运算
pub fn standard_operations(registry: &MasterRegistry) -> Result<Vec<Operation>> {
    STANDARD_OPERATIONS
        .iter()
        .map(|(id, name, code)| registry.parse_operation(*id, *name, code))
        .collect()
}
