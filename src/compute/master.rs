//! 主运算与主运算求值
//!
//! 主运算 (master) 是对单条时间序列运行一次的昂贵计算，产出多字段结果包；
//! 指针运算从结果包中提取标量。
//!
//! 求值完全隔离：主运算返回错误或 panic 都会被捕获并转换为 `ResultBundle::Failed`，
//! 耗时记为零，不会传播给调用方。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::observability::metrics;
use crate::store::{MasterInfo, Operation, TimeSeries};
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 结果包
// ═══════════════════════════════════════════════════════════════════════════

/// 结果包中的一个字段
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(f64),
    Array(Vec<f64>),
    Complex { re: f64, im: f64 },
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Scalar(x)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(xs: Vec<f64>) -> Self {
        FieldValue::Array(xs)
    }
}

/// 主运算对一条序列的输出
#[derive(Debug, Clone, PartialEq)]
pub enum ResultBundle {
    /// 该序列上没有输出 (如序列过短)，不是错误
    NotApplicable,
    /// 求值失败
    Failed(String),
    /// 成功：字段名 → 子结果
    Fields(BTreeMap<String, FieldValue>),
}

impl ResultBundle {
    pub fn from_fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        ResultBundle::Fields(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ResultBundle::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultBundle::Fields(_))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ResultBundle::NotApplicable => "not_applicable",
            ResultBundle::Failed(_) => "failed",
            ResultBundle::Fields(_) => "success",
        }
    }
}

/// 特征算法错误
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("numeric failure: {0}")]
    Numeric(String),

    #[error("{0}")]
    Other(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// 主运算
// ═══════════════════════════════════════════════════════════════════════════

/// 主运算可执行体 (外部特征算法)
///
/// 核心只看输出标签，不关心内部实现。
pub trait MasterComputation: Send + Sync {
    fn compute(&self, data: &[f64]) -> std::result::Result<ResultBundle, ComputeError>;
}

impl<F> MasterComputation for F
where
    F: Fn(&[f64]) -> std::result::Result<ResultBundle, ComputeError> + Send + Sync,
{
    fn compute(&self, data: &[f64]) -> std::result::Result<ResultBundle, ComputeError> {
        self(data)
    }
}

/// 已注册的主运算
#[derive(Clone)]
pub struct MasterOperation {
    pub id: u64,
    pub label: String,
    pub computation: Arc<dyn MasterComputation>,
}

impl MasterOperation {
    pub fn new(id: u64, label: impl Into<String>, computation: Arc<dyn MasterComputation>) -> Self {
        Self {
            id,
            label: label.into(),
            computation,
        }
    }

    pub fn info(&self) -> MasterInfo {
        MasterInfo {
            id: self.id,
            label: self.label.clone(),
        }
    }
}

impl fmt::Debug for MasterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterOperation")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 求值
// ═══════════════════════════════════════════════════════════════════════════

/// 一次主运算求值的结果
#[derive(Debug, Clone)]
pub struct MasterEvaluation {
    pub bundle: Arc<ResultBundle>,
    pub elapsed: Duration,
}

impl MasterEvaluation {
    fn failed(message: String) -> Self {
        Self {
            bundle: Arc::new(ResultBundle::Failed(message)),
            elapsed: Duration::ZERO,
        }
    }

    pub fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// 对一条序列求值一个主运算
///
/// 永不失败也永不 panic：错误与 panic 都转换为 `Failed`，耗时为零。
pub fn evaluate_master(series: &TimeSeries, master: &MasterOperation) -> MasterEvaluation {
    if series.is_empty() {
        log::debug!(
            "Master '{}' not applicable to empty series {}",
            master.label,
            series.id
        );
        metrics::record_master_outcome(&master.label, "not_applicable", None);
        return MasterEvaluation {
            bundle: Arc::new(ResultBundle::NotApplicable),
            elapsed: Duration::ZERO,
        };
    }

    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        master.computation.compute(&series.data)
    }));
    let elapsed = start.elapsed();

    let evaluation = match outcome {
        Ok(Ok(ResultBundle::Failed(msg))) => MasterEvaluation::failed(msg),
        Ok(Ok(bundle)) => MasterEvaluation {
            bundle: Arc::new(bundle),
            elapsed,
        },
        Ok(Err(e)) => MasterEvaluation::failed(e.to_string()),
        Err(payload) => MasterEvaluation::failed(format!("panicked: {}", panic_message(&*payload))),
    };

    match evaluation.bundle.as_ref() {
        ResultBundle::Failed(msg) => {
            log::warn!(
                "Master '{}' failed on series {} ({}): {}",
                master.label,
                series.id,
                series.name,
                msg
            );
        }
        ResultBundle::NotApplicable => {
            log::debug!(
                "Master '{}' not applicable to series {}",
                master.label,
                series.id
            );
        }
        ResultBundle::Fields(fields) => {
            log::debug!(
                "Master '{}' on series {}: {} fields in {:?}",
                master.label,
                series.id,
                fields.len(),
                evaluation.elapsed
            );
        }
    }
    metrics::record_master_outcome(
        &master.label,
        evaluation.bundle.tag(),
        Some(evaluation.elapsed),
    );

    evaluation
}

// ═══════════════════════════════════════════════════════════════════════════
// 主运算注册表
// ═══════════════════════════════════════════════════════════════════════════

/// 主运算注册表 - 管理所有主运算可执行体
#[derive(Debug, Clone, Default)]
pub struct MasterRegistry {
    masters: BTreeMap<u64, MasterOperation>,
    by_label: HashMap<String, u64>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册主运算，ID 与 label 都必须唯一
    pub fn register(
        &mut self,
        id: u64,
        label: impl Into<String>,
        computation: Arc<dyn MasterComputation>,
    ) -> Result<()> {
        let label = label.into();
        if self.masters.contains_key(&id) {
            return Err(Error::InvalidConfig(format!("duplicate master id {}", id)));
        }
        if self.by_label.contains_key(&label) {
            return Err(Error::InvalidConfig(format!(
                "duplicate master label '{}'",
                label
            )));
        }
        self.by_label.insert(label.clone(), id);
        self.masters
            .insert(id, MasterOperation::new(id, label, computation));
        Ok(())
    }

    /// 内置主运算表使用，调用方保证 ID/label 不冲突
    pub(crate) fn insert(&mut self, master: MasterOperation) {
        self.by_label.insert(master.label.clone(), master.id);
        self.masters.insert(master.id, master);
    }

    pub fn get(&self, id: u64) -> Option<&MasterOperation> {
        self.masters.get(&id)
    }

    pub fn get_by_label(&self, label: &str) -> Option<&MasterOperation> {
        self.by_label.get(label).and_then(|id| self.masters.get(id))
    }

    /// 按 ID 排序列出
    pub fn list(&self) -> Vec<&MasterOperation> {
        self.masters.values().collect()
    }

    pub fn infos(&self) -> Vec<MasterInfo> {
        self.masters.values().map(MasterOperation::info).collect()
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// 从 `master_label.transform` 形式的代码创建指针运算
    pub fn parse_operation(&self, id: u64, name: impl Into<String>, code: &str) -> Result<Operation> {
        let (label, transform) = code.split_once('.').ok_or_else(|| Error::InvalidTransform {
            code: code.to_string(),
            reason: "expected 'master_label.transform'".to_string(),
        })?;
        let master = self
            .get_by_label(label.trim())
            .ok_or_else(|| Error::UnknownMaster(label.trim().to_string()))?;
        Operation::new(id, name, master.id, transform)
    }

    /// 检查快照中的主运算元数据能否绑定到本注册表 (ID 与 label 都需一致)
    pub fn check_bound(&self, infos: &[MasterInfo]) -> Result<()> {
        for info in infos {
            match self.get(info.id) {
                Some(m) if m.label == info.label => {}
                Some(m) => {
                    return Err(Error::UnknownMaster(format!(
                        "master id {} is '{}' in registry but '{}' in snapshot",
                        info.id, m.label, info.label
                    )))
                }
                None => {
                    return Err(Error::UnknownMaster(format!(
                        "{} (id {})",
                        info.label, info.id
                    )))
                }
            }
        }
        Ok(())
    }

    /// 创建包含标准主运算的注册表
    pub fn with_standard_masters() -> Self {
        super::operators::standard_registry()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn series(data: Vec<f64>) -> TimeSeries {
        TimeSeries::new(1, "s", data)
    }

    fn master<F>(f: F) -> MasterOperation
    where
        F: Fn(&[f64]) -> std::result::Result<ResultBundle, ComputeError> + Send + Sync + 'static,
    {
        MasterOperation::new(1, "m", Arc::new(f))
    }

    #[test]
    fn test_successful_evaluation() {
        let m = master(|xs: &[f64]| {
            Ok(ResultBundle::from_fields([("n", FieldValue::from(xs.len() as f64))]))
        });
        let eval = evaluate_master(&series(vec![1.0, 2.0]), &m);
        assert_eq!(
            *eval.bundle,
            ResultBundle::from_fields([("n", FieldValue::Scalar(2.0))])
        );
    }

    #[test]
    fn test_error_is_captured() {
        let m = master(|_: &[f64]| Err(ComputeError::Numeric("singular matrix".into())));
        let eval = evaluate_master(&series(vec![1.0]), &m);
        assert_eq!(
            *eval.bundle,
            ResultBundle::Failed("numeric failure: singular matrix".into())
        );
        assert_eq!(eval.elapsed, Duration::ZERO);
    }

    #[test]
    fn test_panic_is_captured() {
        let m = master(|xs: &[f64]| {
            let idx = xs.len() + 10;
            Ok(ResultBundle::from_fields([("x", FieldValue::Scalar(xs[idx]))]))
        });
        let eval = evaluate_master(&series(vec![1.0]), &m);
        assert!(eval.bundle.is_failed());
        assert_eq!(eval.elapsed, Duration::ZERO);
    }

    #[test]
    fn test_self_reported_failure_has_zero_time() {
        let m = master(|_: &[f64]| {
            std::thread::sleep(Duration::from_millis(2));
            Ok(ResultBundle::Failed("gave up".into()))
        });
        let eval = evaluate_master(&series(vec![1.0]), &m);
        assert!(eval.bundle.is_failed());
        assert_eq!(eval.seconds(), 0.0);
    }

    #[test]
    fn test_empty_series_not_applicable() {
        let m = master(|_: &[f64]| panic!("must not be called"));
        let eval = evaluate_master(&series(vec![]), &m);
        assert_eq!(*eval.bundle, ResultBundle::NotApplicable);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = MasterRegistry::new();
        let f: Arc<dyn MasterComputation> =
            Arc::new(|_: &[f64]| Ok::<_, ComputeError>(ResultBundle::NotApplicable));
        registry.register(1, "a", f.clone()).unwrap();
        assert!(registry.register(1, "b", f.clone()).is_err());
        assert!(registry.register(2, "a", f).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_parse_operation_binds_master() {
        let registry = MasterRegistry::with_standard_masters();
        let op = registry.parse_operation(100, "AC_1", "autocorr.acf[1]").unwrap();
        assert_eq!(op.master_id, registry.get_by_label("autocorr").unwrap().id);
        assert_eq!(op.transform.to_string(), "acf[1]");

        assert!(matches!(
            registry.parse_operation(101, "x", "nosuch.mean"),
            Err(Error::UnknownMaster(_))
        ));
        assert!(matches!(
            registry.parse_operation(102, "x", "moments"),
            Err(Error::InvalidTransform { .. })
        ));
    }

    #[test]
    fn test_check_bound() {
        let registry = MasterRegistry::with_standard_masters();
        assert!(registry.check_bound(&registry.infos()).is_ok());
        let bogus = vec![MasterInfo {
            id: registry.infos()[0].id,
            label: "renamed".into(),
        }];
        assert!(registry.check_bound(&bogus).is_err());
    }
}
