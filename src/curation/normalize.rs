//! 列归一化变换
//!
//! 参数只在训练行上拟合 (`fit`)，然后应用到全部行 (`apply`)。
//! 拟合只看有限值；不可用的拟合参数 (如训练行无有限值) 会让整列输出 NaN，
//! 由后续的复核阶段剔除。

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::compute::operators::WelfordState;
use crate::{Error, Result};

/// 四分位距到标准差的换算系数 (正态分布下 IQR ≈ 1.35σ)
const IQR_TO_STD: f64 = 1.35;

/// 归一化变换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormFunction {
    None,
    Zscore,
    MaxMin,
    Sigmoid,
    RobustSigmoid,
    ScaledSigmoid,
    ScaledRobustSigmoid,
    MixedSigmoid,
    Log,
}

impl NormFunction {
    pub const ALL: [NormFunction; 9] = [
        NormFunction::None,
        NormFunction::Zscore,
        NormFunction::MaxMin,
        NormFunction::Sigmoid,
        NormFunction::RobustSigmoid,
        NormFunction::ScaledSigmoid,
        NormFunction::ScaledRobustSigmoid,
        NormFunction::MixedSigmoid,
        NormFunction::Log,
    ];

    /// 接受 snake_case 与 camelCase 两种写法
    pub fn parse(name: &str) -> Result<Self> {
        let f = match name.trim() {
            "none" | "" => NormFunction::None,
            "zscore" => NormFunction::Zscore,
            "maxmin" | "max_min" | "maxMin" => NormFunction::MaxMin,
            "sigmoid" => NormFunction::Sigmoid,
            "robust_sigmoid" | "robustSigmoid" => NormFunction::RobustSigmoid,
            "scaled_sigmoid" | "scaledSigmoid" => NormFunction::ScaledSigmoid,
            "scaled_robust_sigmoid" | "scaledRobustSigmoid" => NormFunction::ScaledRobustSigmoid,
            "mixed_sigmoid" | "mixedSigmoid" => NormFunction::MixedSigmoid,
            "log" => NormFunction::Log,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown normalization function '{}'",
                    other
                )))
            }
        };
        Ok(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            NormFunction::None => "none",
            NormFunction::Zscore => "zscore",
            NormFunction::MaxMin => "maxmin",
            NormFunction::Sigmoid => "sigmoid",
            NormFunction::RobustSigmoid => "robust_sigmoid",
            NormFunction::ScaledSigmoid => "scaled_sigmoid",
            NormFunction::ScaledRobustSigmoid => "scaled_robust_sigmoid",
            NormFunction::MixedSigmoid => "mixed_sigmoid",
            NormFunction::Log => "log",
        }
    }

    pub fn is_identity(self) -> bool {
        self == NormFunction::None
    }

    /// 在训练值上拟合参数，非有限值被忽略
    pub fn fit(self, training: &[f64]) -> NormParams {
        let mut finite: Vec<f64> = training.iter().copied().filter(|x| x.is_finite()).collect();
        if finite.is_empty() {
            return NormParams::UNFITTED;
        }
        finite.sort_by(|a, b| a.total_cmp(b));
        let (lo, hi) = (finite[0], finite[finite.len() - 1]);

        let (center, scale) = match self {
            NormFunction::None | NormFunction::MaxMin | NormFunction::Log => (f64::NAN, f64::NAN),
            NormFunction::Zscore | NormFunction::Sigmoid | NormFunction::ScaledSigmoid => {
                standard(&finite)
            }
            NormFunction::RobustSigmoid | NormFunction::ScaledRobustSigmoid => robust(&finite),
            NormFunction::MixedSigmoid => {
                let (median, scale) = robust(&finite);
                if scale == 0.0 {
                    standard(&finite)
                } else {
                    (median, scale)
                }
            }
        };

        NormParams {
            center,
            scale,
            lo,
            hi,
        }
    }

    /// 用拟合参数变换单个值
    pub fn apply(self, x: f64, p: &NormParams) -> f64 {
        match self {
            NormFunction::None => x,
            NormFunction::Zscore => (x - p.center) / p.scale,
            NormFunction::MaxMin => (x - p.lo) / (p.hi - p.lo),
            NormFunction::Sigmoid | NormFunction::RobustSigmoid | NormFunction::MixedSigmoid => {
                logistic((x - p.center) / p.scale)
            }
            NormFunction::ScaledSigmoid | NormFunction::ScaledRobustSigmoid => {
                let s = |v: f64| logistic((v - p.center) / p.scale);
                let (s_lo, s_hi) = (s(p.lo), s(p.hi));
                (s(x) - s_lo) / (s_hi - s_lo)
            }
            NormFunction::Log => (x - p.lo + 1.0).ln(),
        }
    }
}

impl fmt::Display for NormFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NormFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NormFunction::parse(s)
    }
}

fn logistic(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// (均值, 样本标准差)
fn standard(sorted: &[f64]) -> (f64, f64) {
    let state = WelfordState::from_finite(sorted);
    (state.mean, state.sample_std())
}

/// (中位数, IQR / 1.35)
fn robust(sorted: &[f64]) -> (f64, f64) {
    let iqr = quantile(sorted, 0.75) - quantile(sorted, 0.25);
    (quantile(sorted, 0.5), iqr / IQR_TO_STD)
}

/// 已排序数据的分位数 (线性插值)
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let i = pos.floor() as usize;
            let frac = pos - i as f64;
            if i + 1 >= n {
                sorted[n - 1]
            } else {
                sorted[i] + frac * (sorted[i + 1] - sorted[i])
            }
        }
    }
}

/// 单列拟合参数；未用到的字段为 NaN
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct NormParams {
    pub center: f64,
    pub scale: f64,
    /// 训练值最小值
    pub lo: f64,
    /// 训练值最大值
    pub hi: f64,
}

impl NormParams {
    pub const UNFITTED: NormParams = NormParams {
        center: f64::NAN,
        scale: f64::NAN,
        lo: f64::NAN,
        hi: f64::NAN,
    };
}

/// 按运算 ID 记录的列参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ColumnNormParams {
    pub op_id: u64,
    pub params: NormParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(NormFunction::parse("robustSigmoid").unwrap(), NormFunction::RobustSigmoid);
        assert_eq!(
            NormFunction::parse("scaled_robust_sigmoid").unwrap(),
            NormFunction::ScaledRobustSigmoid
        );
        assert!(NormFunction::parse("softmax").is_err());
        for f in NormFunction::ALL {
            assert_eq!(NormFunction::parse(f.name()).unwrap(), f);
        }
    }

    #[test]
    fn test_zscore() {
        let p = NormFunction::Zscore.fit(&[1.0, 2.0, 3.0]);
        assert!(close(p.center, 2.0));
        assert!(close(p.scale, 1.0));
        assert!(close(NormFunction::Zscore.apply(4.0, &p), 2.0));
    }

    #[test]
    fn test_maxmin_and_log() {
        let data = [2.0, 4.0, 6.0];
        let p = NormFunction::MaxMin.fit(&data);
        assert!(close(NormFunction::MaxMin.apply(2.0, &p), 0.0));
        assert!(close(NormFunction::MaxMin.apply(6.0, &p), 1.0));

        let p = NormFunction::Log.fit(&data);
        assert!(close(NormFunction::Log.apply(2.0, &p), 0.0));
        assert!(close(NormFunction::Log.apply(4.0, &p), 3.0f64.ln()));
    }

    #[test]
    fn test_robust_sigmoid_center_maps_to_half() {
        let data = [1.0, 2.0, 3.0, 4.0, 100.0];
        let p = NormFunction::RobustSigmoid.fit(&data);
        assert!(close(p.center, 3.0));
        assert!(close(p.scale, 2.0 / IQR_TO_STD));
        assert!(close(NormFunction::RobustSigmoid.apply(3.0, &p), 0.5));
    }

    #[test]
    fn test_scaled_sigmoid_spans_unit_interval() {
        let data = [-3.0, 0.5, 1.0, 7.0];
        for f in [NormFunction::ScaledSigmoid, NormFunction::ScaledRobustSigmoid] {
            let p = f.fit(&data);
            assert!(close(f.apply(-3.0, &p), 0.0));
            assert!(close(f.apply(7.0, &p), 1.0));
            let mid = f.apply(1.0, &p);
            assert!(mid > 0.0 && mid < 1.0);
        }
    }

    #[test]
    fn test_mixed_sigmoid_falls_back_when_iqr_zero() {
        // IQR 为 0，但标准差非 0
        let data = [5.0, 5.0, 5.0, 5.0, 5.0, 9.0];
        let p = NormFunction::MixedSigmoid.fit(&data);
        let state = WelfordState::from_finite(&data);
        assert!(close(p.center, state.mean));
        assert!(close(p.scale, state.sample_std()));
    }

    #[test]
    fn test_fit_ignores_non_finite_and_handles_empty() {
        let p = NormFunction::Zscore.fit(&[1.0, f64::NAN, 3.0]);
        assert!(close(p.center, 2.0));

        let p = NormFunction::Zscore.fit(&[f64::NAN]);
        assert!(NormFunction::Zscore.apply(1.0, &p).is_nan());
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!(close(quantile(&sorted, 0.5), 2.5));
        assert!(close(quantile(&sorted, 0.25), 1.75));
        assert!(close(quantile(&sorted, 1.0), 4.0));
    }
}
