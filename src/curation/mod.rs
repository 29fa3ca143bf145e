//! 矩阵整理
//!
//! - 整理流水线 (curator) - 子集、规范化、过滤、去退化、归一化、复核
//! - 归一化 (normalize) - 命名变换，训练行拟合 / 全部行应用

pub mod curator;
pub mod normalize;

pub use curator::*;
pub use normalize::*;
