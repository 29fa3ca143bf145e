//! 值矩阵存储模块
//!
//! - 值矩阵 (matrix) - 值 / 质量码 / 计算耗时三张并行矩阵 + 行列元数据
//! - 快照 (snapshot) - 快照值类型与持久化存储

pub mod matrix;
pub mod snapshot;

pub use matrix::*;
pub use snapshot::*;
