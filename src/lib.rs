//! # TSFEATURE-RS
//!
//! 时间序列特征矩阵引擎
//!
//! ## 核心能力
//!
//! - **主运算求值**: 每条时间序列对每个主运算 (master) 只求值一次，失败隔离
//! - **结果分发**: 主运算结果包 (bundle) 分发给所有依赖它的指针运算 (pointer operation)
//! - **质量码**: 每个单元格记录 Good / Error / NotApplicable / NotComputed
//! - **矩阵整理**: 坏值裁剪、退化行列剔除、归一化、归一化后复检
//! - **快照持久化**: rkyv + zstd 文件快照
//!
//! ## 架构设计
//!
//! ```text
//! BatchScheduler (compute/scheduler)
//!     ↓ 每 (序列, 主运算) 一次
//! MasterEvaluator (compute/master)
//!     ↓ Arc<ResultBundle>
//! OperationResolver (compute/resolver)
//!     ↓ (value, quality, time)
//! ValueStore (store/matrix)
//!     ↓ Snapshot
//! MatrixCurator (curation/curator)
//! ```

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

pub use rayon;

pub use serde;
pub use serde_json;

pub use log;

pub use anyhow;
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// 值矩阵 + 快照持久化
pub mod store;

/// 主运算求值、指针运算解析、批量调度
pub mod compute;

/// 矩阵整理流水线
pub mod curation;

/// 工具模块 (配置)
pub mod utils;

/// 可观测性模块 (Prometheus)
pub mod observability;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use compute::{
    evaluate_master, resolve, BatchReport, BatchScheduler, ComputeError, ComputeMode,
    FieldValue, MasterComputation, MasterEvaluation, MasterOperation, MasterRegistry,
    ResultBundle, ScalarFn, SchedulerConfig, Transform,
};
pub use curation::{
    curate, CurationConfig, CurationOutcome, CurationReport, CurationStage, NormFunction,
    NormalizationInfo,
};
pub use store::{
    FileSnapshotStore, MasterInfo, Matrix, MemorySnapshotStore, Operation, Quality, Snapshot,
    SnapshotStore, TimeSeries, ValueStore,
};

// ============================================================================
// 全局错误类型
// ============================================================================

/// 特征矩阵错误类型
///
/// 单元格级别的计算失败不会出现在这里，它们只会降级为质量码。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("All rows filtered out (threshold {threshold})")]
    AllRowsFiltered { threshold: f64 },

    #[error("All columns filtered out (threshold {threshold})")]
    AllColumnsFiltered { threshold: f64 },

    #[error("No good values remain after normalization with '{0}'")]
    NoGoodValuesAfterNormalization(String),

    #[error("Unknown master operation: {0}")]
    UnknownMaster(String),

    #[error("Invalid transform '{code}': {reason}")]
    InvalidTransform { code: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
