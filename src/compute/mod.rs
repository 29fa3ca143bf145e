//! 特征计算模块
//!
//! - 主运算 (master) - 主运算可执行体、注册表、隔离求值
//! - 解析器 (resolver) - 指针运算提取规则与质量码判定
//! - 调度器 (scheduler) - 每 (序列, 主运算) 一次求值并分发结果
//! - 标准算子 (operators) - 内置参考主运算

pub mod master;
pub mod operators;
pub mod resolver;
pub mod scheduler;

pub use master::*;
pub use resolver::*;
pub use scheduler::*;
