//! 快照与快照存储
//!
//! 快照 = 值矩阵 + 元数据 + 主运算信息 + 归一化信息，作为一个整体持久化。
//! 流水线各阶段之间以 `Snapshot` 值传递，持久化只发生在入口和出口。
//!
//! 文件格式: `TSFS` 魔数 + 1 字节标志 (bit0 = zstd) + rkyv 归档。

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::matrix::{Matrix, Operation, Quality, TimeSeries, ValueStore};
use crate::curation::NormalizationInfo;
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 快照
// ═══════════════════════════════════════════════════════════════════════════

/// 主运算元数据 (可执行体不持久化，加载后按 label 从注册表重新绑定)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MasterInfo {
    pub id: u64,
    pub label: String,
}

/// 一致的 (矩阵 + 元数据) 快照
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub store: ValueStore,
    pub masters: Vec<MasterInfo>,
    pub normalization: Option<NormalizationInfo>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(store: ValueStore, masters: Vec<MasterInfo>) -> Self {
        Self {
            store,
            masters,
            normalization: None,
            created_at: Utc::now(),
        }
    }

    /// 检查矩阵形状，以及每个运算引用的主运算都存在
    pub fn validate(&self) -> Result<()> {
        self.store.check_consistency()?;
        for op in self.store.operations() {
            if !self.masters.iter().any(|m| m.id == op.master_id) {
                return Err(Error::UnknownMaster(format!(
                    "operation {} references master id {}",
                    op.id, op.master_id
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 可序列化记录
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct SerializableTimeSeries {
    id: u64,
    name: String,
    keywords: Vec<String>,
    data: Vec<f64>,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct SerializableOperation {
    id: u64,
    name: String,
    keywords: Vec<String>,
    master_id: u64,
    transform_code: String,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct SerializableMaster {
    id: u64,
    label: String,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct SnapshotRecord {
    version: u32,
    created_at_ms: i64,
    time_series: Vec<SerializableTimeSeries>,
    operations: Vec<SerializableOperation>,
    masters: Vec<SerializableMaster>,
    values: Vec<f64>,
    quality: Vec<u8>,
    calc_time: Vec<f64>,
    normalization: Option<NormalizationInfo>,
}

impl SnapshotRecord {
    const CURRENT_VERSION: u32 = 1;

    fn from_snapshot(snapshot: &Snapshot) -> Self {
        let store = &snapshot.store;
        Self {
            version: Self::CURRENT_VERSION,
            created_at_ms: snapshot.created_at.timestamp_millis(),
            time_series: store
                .time_series()
                .iter()
                .map(|ts| SerializableTimeSeries {
                    id: ts.id,
                    name: ts.name.clone(),
                    keywords: ts.keywords.clone(),
                    data: ts.data.clone(),
                })
                .collect(),
            operations: store
                .operations()
                .iter()
                .map(|op| SerializableOperation {
                    id: op.id,
                    name: op.name.clone(),
                    keywords: op.keywords.clone(),
                    master_id: op.master_id,
                    transform_code: op.transform.to_string(),
                })
                .collect(),
            masters: snapshot
                .masters
                .iter()
                .map(|m| SerializableMaster {
                    id: m.id,
                    label: m.label.clone(),
                })
                .collect(),
            values: store.values().as_slice().to_vec(),
            quality: store.quality().as_slice().iter().map(|q| q.code()).collect(),
            calc_time: store.calc_time().as_slice().to_vec(),
            normalization: snapshot.normalization.clone(),
        }
    }

    fn into_snapshot(self) -> Result<Snapshot> {
        if self.version != Self::CURRENT_VERSION {
            return Err(Error::Serialization(format!(
                "snapshot version mismatch: expected {}, found {}",
                Self::CURRENT_VERSION,
                self.version
            )));
        }

        let rows = self.time_series.len();
        let cols = self.operations.len();

        let time_series = self
            .time_series
            .into_iter()
            .map(|ts| TimeSeries {
                id: ts.id,
                name: ts.name,
                keywords: ts.keywords,
                data: ts.data,
            })
            .collect();

        let operations = self
            .operations
            .into_iter()
            .map(|op| {
                Operation::new(op.id, op.name, op.master_id, &op.transform_code)
                    .map(|o| o.with_keywords(op.keywords))
            })
            .collect::<Result<Vec<_>>>()?;

        let quality = self
            .quality
            .into_iter()
            .map(|code| {
                Quality::from_code(code)
                    .ok_or_else(|| Error::Serialization(format!("invalid quality code {}", code)))
            })
            .collect::<Result<Vec<_>>>()?;

        let store = ValueStore::from_parts(
            time_series,
            operations,
            Matrix::from_vec(rows, cols, self.values)?,
            Matrix::from_vec(rows, cols, quality)?,
            Matrix::from_vec(rows, cols, self.calc_time)?,
        )?;

        let created_at = Utc
            .timestamp_millis_opt(self.created_at_ms)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Snapshot {
            store,
            masters: self
                .masters
                .into_iter()
                .map(|m| MasterInfo {
                    id: m.id,
                    label: m.label,
                })
                .collect(),
            normalization: self.normalization,
            created_at,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 快照存储
// ═══════════════════════════════════════════════════════════════════════════

/// 快照存储：按名称存取的不透明 blob 存储
pub trait SnapshotStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Snapshot>;

    /// 整体保存；失败时不得破坏同名旧快照
    fn save(&self, name: &str, snapshot: &Snapshot) -> Result<()>;

    fn list(&self) -> Result<Vec<String>>;
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(Error::InvalidConfig(format!("invalid snapshot name '{}'", name)));
    }
    Ok(())
}

const MAGIC: &[u8; 4] = b"TSFS";
const FLAG_ZSTD: u8 = 0b0000_0001;
const SNAPSHOT_EXT: &str = "snap";

/// 文件快照存储配置
#[derive(Debug, Clone)]
pub struct FileSnapshotStoreConfig {
    /// 存储目录
    pub base_path: PathBuf,
    /// 是否 zstd 压缩
    pub compress: bool,
    /// zstd 压缩级别
    pub compression_level: i32,
}

impl Default for FileSnapshotStoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/snapshots"),
            compress: true,
            compression_level: 3,
        }
    }
}

/// 文件快照存储 (每个快照一个 `<name>.snap` 文件)
pub struct FileSnapshotStore {
    config: FileSnapshotStoreConfig,
}

impl FileSnapshotStore {
    pub fn new(config: FileSnapshotStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_path)?;
        Ok(Self { config })
    }

    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        Self::new(FileSnapshotStoreConfig {
            base_path: base_path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.config
            .base_path
            .join(format!("{}.{}", name, SNAPSHOT_EXT))
    }

    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let record = SnapshotRecord::from_snapshot(snapshot);
        let archived = rkyv::to_bytes::<_, 4096>(&record)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(archived.len() + MAGIC.len() + 1);
        out.extend_from_slice(MAGIC);
        if self.config.compress {
            out.push(FLAG_ZSTD);
            let compressed = zstd::encode_all(archived.as_slice(), self.config.compression_level)?;
            out.extend_from_slice(&compressed);
        } else {
            out.push(0);
            out.extend_from_slice(archived.as_slice());
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Snapshot> {
        if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Serialization("not a snapshot file".to_string()));
        }
        let flags = bytes[MAGIC.len()];
        let body = &bytes[MAGIC.len() + 1..];

        let raw = if flags & FLAG_ZSTD != 0 {
            zstd::decode_all(body)?
        } else {
            body.to_vec()
        };

        // rkyv 校验要求对齐的缓冲区
        let mut aligned = rkyv::AlignedVec::with_capacity(raw.len());
        aligned.extend_from_slice(&raw);

        let archived = rkyv::check_archived_root::<SnapshotRecord>(&aligned)
            .map_err(|e| Error::Serialization(format!("corrupted snapshot: {}", e)))?;
        let record: SnapshotRecord = archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|_| Error::Serialization("deserialization failed".to_string()))?;

        record.into_snapshot()
    }
}

/// 写入并 fsync
fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| Error::Storage(e.to_string()))?
        .sync_all()?;
    Ok(())
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, name: &str) -> Result<Snapshot> {
        check_name(name)?;
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Err(Error::SnapshotNotFound(name.to_string()));
        }

        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let snapshot = Self::decode(&bytes)?;

        log::info!(
            "Loaded snapshot '{}' ({}x{}) from {:?}",
            name,
            snapshot.store.n_rows(),
            snapshot.store.n_cols(),
            path
        );
        Ok(snapshot)
    }

    fn save(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        check_name(name)?;
        let bytes = self.encode(snapshot)?;

        // 先写临时文件再 rename，失败不影响旧快照
        let path = self.snapshot_path(name);
        let tmp_path = self
            .config
            .base_path
            .join(format!(".{}.{}.tmp", name, SNAPSHOT_EXT));
        let written = write_synced(&tmp_path, &bytes)
            .and_then(|()| fs::rename(&tmp_path, &path).map_err(Error::from));
        if let Err(e) = written {
            if let Err(rm) = fs::remove_file(&tmp_path) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove temp file {:?}: {}", tmp_path, rm);
                }
            }
            log::error!("Failed to save snapshot '{}': {}", name, e);
            return Err(e);
        }

        log::info!(
            "Saved snapshot '{}' ({}x{}, {} bytes) to {:?}",
            name,
            snapshot.store.n_rows(),
            snapshot.store.n_cols(),
            bytes.len(),
            path
        );
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.base_path)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// 内存快照存储
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, name: &str) -> Result<Snapshot> {
        self.snapshots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
    }

    fn save(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        check_name(name)?;
        self.snapshots
            .write()
            .insert(name.to_string(), snapshot.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.snapshots.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
