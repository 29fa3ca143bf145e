//! 指针运算解析器
//!
//! 指针运算的提取规则在加载时解析为封闭的变体类型，求值时不再做字符串查找。
//!
//! 规则语法:
//! ```text
//! field            选择标量字段
//! field[i]         选择数组字段的第 i 个元素 (从 0 开始)
//! field|fn         选择字段后应用标量函数
//! field[i]|fn
//! ```

use std::collections::BTreeMap;
use std::fmt;

use super::master::{FieldValue, ResultBundle};
use crate::store::Quality;
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 提取规则
// ═══════════════════════════════════════════════════════════════════════════

/// 后处理函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFn {
    // 逐元素 (标量输入)
    Abs,
    Neg,
    Log,
    Log10,
    Exp,
    Sqrt,
    Square,
    // 归约 (数组输入)
    Mean,
    Std,
    Min,
    Max,
    Median,
    Sum,
    Len,
    // 复数
    Real,
    Imag,
    Modulus,
}

impl ScalarFn {
    pub fn parse(name: &str) -> Option<Self> {
        let f = match name {
            "abs" => ScalarFn::Abs,
            "neg" => ScalarFn::Neg,
            "log" => ScalarFn::Log,
            "log10" => ScalarFn::Log10,
            "exp" => ScalarFn::Exp,
            "sqrt" => ScalarFn::Sqrt,
            "square" => ScalarFn::Square,
            "mean" => ScalarFn::Mean,
            "std" => ScalarFn::Std,
            "min" => ScalarFn::Min,
            "max" => ScalarFn::Max,
            "median" => ScalarFn::Median,
            "sum" => ScalarFn::Sum,
            "len" => ScalarFn::Len,
            "real" => ScalarFn::Real,
            "imag" => ScalarFn::Imag,
            "modulus" => ScalarFn::Modulus,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarFn::Abs => "abs",
            ScalarFn::Neg => "neg",
            ScalarFn::Log => "log",
            ScalarFn::Log10 => "log10",
            ScalarFn::Exp => "exp",
            ScalarFn::Sqrt => "sqrt",
            ScalarFn::Square => "square",
            ScalarFn::Mean => "mean",
            ScalarFn::Std => "std",
            ScalarFn::Min => "min",
            ScalarFn::Max => "max",
            ScalarFn::Median => "median",
            ScalarFn::Sum => "sum",
            ScalarFn::Len => "len",
            ScalarFn::Real => "real",
            ScalarFn::Imag => "imag",
            ScalarFn::Modulus => "modulus",
        }
    }

    fn apply_scalar(self, x: f64) -> std::result::Result<f64, ExtractError> {
        let y = match self {
            ScalarFn::Abs | ScalarFn::Modulus => x.abs(),
            ScalarFn::Neg => -x,
            ScalarFn::Log => x.ln(),
            ScalarFn::Log10 => x.log10(),
            ScalarFn::Exp => x.exp(),
            ScalarFn::Sqrt => x.sqrt(),
            ScalarFn::Square => x * x,
            ScalarFn::Real => x,
            ScalarFn::Imag => 0.0,
            _ => return Err(ExtractError::FnNotApplicable(self, "scalar")),
        };
        Ok(y)
    }

    fn apply_array(self, xs: &[f64]) -> std::result::Result<f64, ExtractError> {
        let n = xs.len() as f64;
        let y = match self {
            ScalarFn::Len => n,
            ScalarFn::Sum => xs.iter().sum(),
            ScalarFn::Mean => xs.iter().sum::<f64>() / n,
            ScalarFn::Std => {
                if xs.len() < 2 {
                    f64::NAN
                } else {
                    let mean = xs.iter().sum::<f64>() / n;
                    let ss: f64 = xs.iter().map(|x| (x - mean) * (x - mean)).sum();
                    (ss / (n - 1.0)).sqrt()
                }
            }
            ScalarFn::Min => xs.iter().copied().fold(f64::NAN, f64::min),
            ScalarFn::Max => xs.iter().copied().fold(f64::NAN, f64::max),
            ScalarFn::Median => median(xs),
            _ => return Err(ExtractError::FnNotApplicable(self, "array")),
        };
        Ok(y)
    }

    fn apply_complex(self, re: f64, im: f64) -> std::result::Result<f64, ExtractError> {
        match self {
            ScalarFn::Real => Ok(re),
            ScalarFn::Imag => Ok(im),
            ScalarFn::Modulus | ScalarFn::Abs => Ok(re.hypot(im)),
            _ => Err(ExtractError::FnNotApplicable(self, "complex")),
        }
    }
}

fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// 字段选择器
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSelector {
    pub field: String,
    pub index: Option<usize>,
}

/// 提取规则
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transform {
    /// 选择字段
    SelectField(FieldSelector),
    /// 选择字段后应用函数
    SelectAndApply(FieldSelector, ScalarFn),
}

impl Transform {
    pub fn field(name: impl Into<String>) -> Self {
        Transform::SelectField(FieldSelector {
            field: name.into(),
            index: None,
        })
    }

    /// 解析提取规则
    pub fn parse(code: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTransform {
            code: code.to_string(),
            reason: reason.to_string(),
        };

        let code_trimmed = code.trim();
        let (selector_part, fn_part) = match code_trimmed.split_once('|') {
            Some((s, f)) => (s.trim(), Some(f.trim())),
            None => (code_trimmed, None),
        };

        let (field, index) = match selector_part.split_once('[') {
            Some((field, rest)) => {
                let idx_str = rest
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("unterminated index"))?;
                let idx = idx_str
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("index is not a non-negative integer"))?;
                (field.trim(), Some(idx))
            }
            None => (selector_part, None),
        };

        if field.is_empty() {
            return Err(invalid("empty field name"));
        }
        if !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid("field name must be [A-Za-z0-9_]"));
        }

        let selector = FieldSelector {
            field: field.to_string(),
            index,
        };

        match fn_part {
            None => Ok(Transform::SelectField(selector)),
            Some(name) => {
                let func = ScalarFn::parse(name)
                    .ok_or_else(|| invalid(&format!("unknown function '{}'", name)))?;
                Ok(Transform::SelectAndApply(selector, func))
            }
        }
    }

    pub fn selector(&self) -> &FieldSelector {
        match self {
            Transform::SelectField(s) | Transform::SelectAndApply(s, _) => s,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let selector = self.selector();
        write!(f, "{}", selector.field)?;
        if let Some(i) = selector.index {
            write!(f, "[{}]", i)?;
        }
        if let Transform::SelectAndApply(_, func) = self {
            write!(f, "|{}", func.name())?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 解析
// ═══════════════════════════════════════════════════════════════════════════

/// 提取失败原因 (最终都映射为 Quality::Error)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("master evaluation failed: {0}")]
    MasterFailed(String),

    #[error("master not applicable")]
    NotApplicable,

    #[error("field '{0}' not in bundle")]
    MissingField(String),

    #[error("index {index} out of range for field '{field}' (len {len})")]
    IndexOutOfRange { field: String, index: usize, len: usize },

    #[error("field '{0}' cannot be indexed")]
    NotIndexable(String),

    #[error("field '{0}' is an array; select an element or reduce it")]
    NotScalar(String),

    #[error("field '{0}' is complex; use real/imag/modulus")]
    ComplexValue(String),

    #[error("function '{name}' not applicable to {1} input", name = .0.name())]
    FnNotApplicable(ScalarFn, &'static str),

    #[error("non-finite result {0}")]
    NonFinite(f64),
}

impl ExtractError {
    pub fn quality(&self) -> Quality {
        match self {
            ExtractError::NotApplicable => Quality::NotApplicable,
            _ => Quality::Error,
        }
    }
}

enum Selected<'a> {
    Scalar(f64),
    Array(&'a [f64]),
    Complex(f64, f64),
}

fn select<'a>(
    fields: &'a BTreeMap<String, FieldValue>,
    selector: &FieldSelector,
) -> std::result::Result<Selected<'a>, ExtractError> {
    let value = fields
        .get(&selector.field)
        .ok_or_else(|| ExtractError::MissingField(selector.field.clone()))?;

    match (value, selector.index) {
        (FieldValue::Scalar(x), None) => Ok(Selected::Scalar(*x)),
        (FieldValue::Array(xs), None) => Ok(Selected::Array(xs)),
        (FieldValue::Complex { re, im }, None) => Ok(Selected::Complex(*re, *im)),
        (FieldValue::Array(xs), Some(i)) => {
            xs.get(i)
                .map(|x| Selected::Scalar(*x))
                .ok_or_else(|| ExtractError::IndexOutOfRange {
                    field: selector.field.clone(),
                    index: i,
                    len: xs.len(),
                })
        }
        (_, Some(_)) => Err(ExtractError::NotIndexable(selector.field.clone())),
    }
}

/// 从结果包中提取标量，返回详细错误
pub fn extract(bundle: &ResultBundle, transform: &Transform) -> std::result::Result<f64, ExtractError> {
    let fields = match bundle {
        ResultBundle::Failed(msg) => return Err(ExtractError::MasterFailed(msg.clone())),
        ResultBundle::NotApplicable => return Err(ExtractError::NotApplicable),
        ResultBundle::Fields(fields) => fields,
    };

    let selector = transform.selector();
    let selected = select(fields, selector)?;

    let value = match (transform, selected) {
        (Transform::SelectField(_), Selected::Scalar(x)) => x,
        (Transform::SelectField(_), Selected::Array(_)) => {
            return Err(ExtractError::NotScalar(selector.field.clone()))
        }
        (Transform::SelectField(_), Selected::Complex(..)) => {
            return Err(ExtractError::ComplexValue(selector.field.clone()))
        }
        (Transform::SelectAndApply(_, func), Selected::Scalar(x)) => func.apply_scalar(x)?,
        (Transform::SelectAndApply(_, func), Selected::Array(xs)) => func.apply_array(xs)?,
        (Transform::SelectAndApply(_, func), Selected::Complex(re, im)) => {
            func.apply_complex(re, im)?
        }
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(ExtractError::NonFinite(value))
    }
}

/// 解析一个单元格: (值, 质量码)
///
/// 优先级: 主运算失败 → Error；不适用 → NotApplicable；
/// 字段缺失/函数失败/非有限值 → Error；否则 Good。
pub fn resolve(bundle: &ResultBundle, transform: &Transform) -> (f64, Quality) {
    match extract(bundle, transform) {
        Ok(value) => (value, Quality::Good),
        Err(e) => (f64::NAN, e.quality()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> ResultBundle {
        ResultBundle::from_fields([
            ("mean", FieldValue::Scalar(-2.0)),
            ("zero", FieldValue::Scalar(0.0)),
            ("acf", FieldValue::Array(vec![1.0, 0.5, 0.25, -0.1])),
            ("empty", FieldValue::Array(vec![])),
            ("dft1", FieldValue::Complex { re: 3.0, im: 4.0 }),
            ("inf", FieldValue::Scalar(f64::INFINITY)),
        ])
    }

    #[test]
    fn test_parse_and_display() {
        for code in ["mean", "acf[2]", "mean|abs", "acf[0]|square", "dft1|modulus"] {
            let t = Transform::parse(code).unwrap();
            assert_eq!(t.to_string(), code);
        }
        assert_eq!(
            Transform::parse(" acf [ 1 ] | neg ").unwrap().to_string(),
            "acf[1]|neg"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for code in ["", "|abs", "acf[", "acf[-1]", "acf[x]", "mean|nope", "a.b", "a b"] {
            assert!(
                matches!(Transform::parse(code), Err(Error::InvalidTransform { .. })),
                "{} should be rejected",
                code
            );
        }
    }

    #[test]
    fn test_good_values() {
        let b = bundle();
        let cases = [
            ("mean", -2.0),
            ("mean|abs", 2.0),
            ("acf[1]", 0.5),
            ("acf|len", 4.0),
            ("acf|max", 1.0),
            ("acf|median", 0.375),
            ("dft1|modulus", 5.0),
            ("dft1|imag", 4.0),
            ("empty|len", 0.0),
        ];
        for (code, expected) in cases {
            let (v, q) = resolve(&b, &Transform::parse(code).unwrap());
            assert_eq!(q, Quality::Good, "{}", code);
            assert!((v - expected).abs() < 1e-12, "{} = {}", code, v);
        }
    }

    #[test]
    fn test_master_outcome_precedence() {
        let t = Transform::parse("mean").unwrap();

        let (v, q) = resolve(&ResultBundle::Failed("boom".into()), &t);
        assert!(v.is_nan());
        assert_eq!(q, Quality::Error);

        let (v, q) = resolve(&ResultBundle::NotApplicable, &t);
        assert!(v.is_nan());
        assert_eq!(q, Quality::NotApplicable);
    }

    #[test]
    fn test_extraction_failures_are_errors() {
        let b = bundle();
        let failing = [
            "missing",      // 字段缺失
            "acf",          // 数组未归约
            "acf[9]",       // 越界
            "mean[0]",      // 标量不可索引
            "dft1",         // 复数
            "mean|log",     // ln(-2) = NaN
            "zero|log",     // -inf
            "inf",          // 非有限
            "mean|mean",    // 归约用于标量
            "acf|abs",      // 逐元素函数用于数组
            "dft1|sqrt",    // 复数不支持
            "empty|mean",   // 0/0
            "empty|median", // 空数组
        ];
        for code in failing {
            let (v, q) = resolve(&b, &Transform::parse(code).unwrap());
            assert!(v.is_nan(), "{}", code);
            assert_eq!(q, Quality::Error, "{}", code);
        }
    }

    #[test]
    fn test_quality_is_total_over_bundle_tags() {
        let bundles = [
            bundle(),
            ResultBundle::NotApplicable,
            ResultBundle::Failed(String::new()),
            ResultBundle::from_fields(Vec::<(&str, FieldValue)>::new()),
        ];
        let transforms = ["mean", "acf[1]", "acf|std", "dft1|real", "x|exp"];
        for b in &bundles {
            for code in transforms {
                let (v, q) = resolve(b, &Transform::parse(code).unwrap());
                assert!(Quality::ALL.contains(&q));
                assert_ne!(q, Quality::NotComputed);
                assert_eq!(q.is_good(), v.is_finite());
            }
        }
    }

    #[test]
    fn test_extract_reports_reason() {
        let b = bundle();
        assert_eq!(
            extract(&b, &Transform::field("missing")),
            Err(ExtractError::MissingField("missing".into()))
        );
        assert!(matches!(
            extract(&b, &Transform::parse("acf[7]").unwrap()),
            Err(ExtractError::IndexOutOfRange { index: 7, len: 4, .. })
        ));
    }
}
