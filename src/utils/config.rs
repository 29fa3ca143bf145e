//! 配置管理模块
//!
//! `config/tsfeature.toml` 示例：
//!
//! ```toml
//! [storage]
//! base_path = "./data/snapshots"
//! compress = true
//!
//! [scheduler]
//! parallel = true
//! mode = "missing_or_error"
//!
//! [curation]
//! norm_function = "mixed_sigmoid"
//! row_thresh = 0.7
//! col_thresh = 1.0
//!
//! [log]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::compute::SchedulerConfig;
use crate::curation::CurationConfig;
use crate::store::FileSnapshotStoreConfig;
use crate::{Error, Result};

/// 顶层配置，所有段都可省略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TsFeatureConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub curation: CurationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl TsFeatureConfig {
    /// 从文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// 加载默认配置文件
    pub fn load_default() -> Result<Self> {
        Self::load_from_file("config/tsfeature.toml")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.curation.validate()?;
        Ok(config)
    }
}

/// 快照存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            compress: true,
            compression_level: default_compression_level(),
        }
    }
}

impl StorageConfig {
    pub fn to_store_config(&self) -> FileSnapshotStoreConfig {
        FileSnapshotStoreConfig {
            base_path: self.base_path.clone(),
            compress: self.compress,
            compression_level: self.compression_level,
        }
    }
}

/// 日志配置 (`RUST_LOG` 优先)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./data/snapshots")
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}
