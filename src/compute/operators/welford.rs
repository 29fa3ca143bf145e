//! Welford 算法 - 数值稳定的单遍统计
//!
//! - 避免大数相减导致的精度损失
//! - 支持均值、方差、标准差、偏度、峰度
//! - 支持状态合并
//!
//! 用于 `moments` 主运算与归一化参数拟合。

/// Welford 单变量统计状态
#[derive(Debug, Clone, Default)]
pub struct WelfordState {
    /// 数据点数量
    pub count: u64,
    /// 均值
    pub mean: f64,
    /// M2 = Σ(x - mean)²
    pub m2: f64,
    /// M3 = Σ(x - mean)³ (用于偏度)
    pub m3: f64,
    /// M4 = Σ(x - mean)⁴ (用于峰度)
    pub m4: f64,
}

impl WelfordState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对切片中的有限值做一次扫描，跳过 NaN/Inf
    pub fn from_finite(values: &[f64]) -> Self {
        let mut state = Self::new();
        for &x in values.iter().filter(|x| x.is_finite()) {
            state.update(x);
        }
        state
    }

    /// 增量更新
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * (n - 1.0);

        self.mean += delta_n;

        // 高阶矩必须先于低阶矩更新
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;
    }

    /// 方差 (总体)
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// 方差 (样本)
    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// 标准差 (总体)
    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    /// 标准差 (样本)
    pub fn sample_std(&self) -> f64 {
        self.sample_variance().sqrt()
    }

    /// 偏度 (Skewness)
    pub fn skewness(&self) -> f64 {
        if self.count < 3 || self.m2 == 0.0 {
            0.0
        } else {
            let n = self.count as f64;
            (n.sqrt() * self.m3) / self.m2.powf(1.5)
        }
    }

    /// 峰度 (excess kurtosis)
    pub fn kurtosis(&self) -> f64 {
        if self.count < 4 || self.m2 == 0.0 {
            0.0
        } else {
            let n = self.count as f64;
            (n * self.m4) / (self.m2 * self.m2) - 3.0
        }
    }

    /// 合并两个状态
    pub fn merge(&self, other: &WelfordState) -> WelfordState {
        if self.count == 0 {
            return other.clone();
        }
        if other.count == 0 {
            return self.clone();
        }

        let delta = other.mean - self.mean;
        let delta2 = delta * delta;
        let delta3 = delta * delta2;
        let delta4 = delta2 * delta2;

        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;

        WelfordState {
            count: self.count + other.count,
            mean: (self.mean * n1 + other.mean * n2) / n,
            m2: self.m2 + other.m2 + delta2 * n1 * n2 / n,
            m3: self.m3
                + other.m3
                + delta3 * n1 * n2 * (n1 - n2) / (n * n)
                + 3.0 * delta * (n1 * other.m2 - n2 * self.m2) / n,
            m4: self.m4
                + other.m4
                + delta4 * n1 * n2 * (n1 * n1 - n1 * n2 + n2 * n2) / (n * n * n)
                + 6.0 * delta2 * (n1 * n1 * other.m2 + n2 * n2 * self.m2) / (n * n)
                + 4.0 * delta * (n1 * other.m3 - n2 * self.m3) / n,
        }
    }
}
