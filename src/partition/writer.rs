use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::core::{MetadataChange, MetadataTransaction, PartitionKey, Record, Table};
use crate::error::{PartitionError, Result};
use crate::partition::policy::upgrade_to_lsm_v2;
use crate::partition::reader::PartitionReader;
use crate::partition::snapshot::{PartitionSnapshot, SegmentHandle};
use crate::storage::segment::parse_segment_version;
use crate::storage::{segment_file_name, write_segment, DescriptorStore, StorageFormat};

/// 一次成功提交后的快照摘要
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub version: u64,
    pub file_count: usize,
    pub record_count: u64,
    pub total_size: u64,
}

impl CommitInfo {
    fn of(snap: &PartitionSnapshot) -> Self {
        Self {
            version: snap.version(),
            file_count: snap.file_count(),
            record_count: snap.record_count(),
            total_size: snap.total_size(),
        }
    }
}

/// 分区唯一的写者：唯一有权发布新快照的组件
///
/// 提交流程：
/// 1) 在私有工作副本上完成变更（写新段 / 合并段）
/// 2) 构造新的不可变快照并持久化 descriptor
/// 3) 原子切换 head
///
/// 1)~2) 任一步失败都会清理新产生的文件，head 保持原样；3) 是最后一步，不可失败。
pub struct PartitionWriter {
    key: PartitionKey,
    dir: PathBuf,
    head: Arc<ArcSwap<PartitionSnapshot>>,
    descriptor: DescriptorStore,
    table: Arc<Table>,
    config: Arc<ServerConfig>,
    commit_lock: Mutex<()>,
}

impl PartitionWriter {
    pub(crate) fn open(
        key: PartitionKey,
        dir: PathBuf,
        head: Arc<ArcSwap<PartitionSnapshot>>,
        table: Arc<Table>,
        config: Arc<ServerConfig>,
    ) -> Result<Self> {
        let unavailable = |reason: String| PartitionError::WriterUnavailable {
            key: key.clone(),
            reason,
        };

        std::fs::create_dir_all(&dir)
            .map_err(|e| unavailable(format!("cannot prepare {}: {}", dir.display(), e)))?;
        if !dir.is_dir() {
            return Err(unavailable(format!("{} is not a directory", dir.display())));
        }

        let removed = gc_orphans(&dir, &head.load());
        if removed > 0 {
            tracing::info!("Writer {}: removed {} orphan files from earlier crashed commits", key, removed);
        }

        Ok(Self {
            descriptor: DescriptorStore::in_dir(&dir),
            key,
            dir,
            head,
            table,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 追加一批记录，生成一个新段
    pub fn append(&self, records: Vec<Record>) -> Result<CommitInfo> {
        let _g = self.commit_lock.lock();
        let current = self.head.load_full();
        if records.is_empty() {
            return Ok(CommitInfo::of(&current));
        }

        let mut next = current.successor();
        let name = segment_file_name(next.version);
        let stats = write_segment(&self.dir.join(&name), &records)
            .map_err(|e| self.commit_failed("append", e))?;
        let segment = Arc::new(SegmentHandle::new(&self.dir, name, stats.size_bytes, stats.record_count));
        next.segments.push(segment.clone());
        next.recompute_totals();

        if let Err(e) = self.descriptor.write_atomic(&next.to_descriptor()) {
            // 新段尚未被任何已发布快照引用：随 next 一起丢弃
            segment.mark_obsolete();
            return Err(self.commit_failed("append", e));
        }

        Ok(self.publish(next, "append"))
    }

    /// 把全部段合并为一个（同 id 只保留最新版本）
    ///
    /// 段数不足 2 时返回 `Ok(None)`。被取代的段在最后一个持有旧快照的读者释放后删除。
    pub fn compact(&self) -> Result<Option<CommitInfo>> {
        let _g = self.commit_lock.lock();
        let current = self.head.load_full();
        if current.file_count() < 2 {
            tracing::debug!("Compaction skipped for {}: {} segments", self.key, current.file_count());
            return Ok(None);
        }

        let merged = PartitionReader::new(current.clone())
            .latest()
            .map_err(|e| self.commit_failed("compact", e))?;

        let mut next = current.successor();
        let name = segment_file_name(next.version);
        let stats = write_segment(&self.dir.join(&name), &merged)
            .map_err(|e| self.commit_failed("compact", e))?;
        let segment = Arc::new(SegmentHandle::new(&self.dir, name, stats.size_bytes, stats.record_count));
        next.segments = vec![segment.clone()];
        next.recompute_totals();
        if upgrade_to_lsm_v2(&current, &self.table, &self.config.lsm) {
            next.format = StorageFormat::LsmV2;
        }

        if let Err(e) = self.descriptor.write_atomic(&next.to_descriptor()) {
            segment.mark_obsolete();
            return Err(self.commit_failed("compact", e));
        }

        let info = self.publish(next, "compact");
        for old in current.segments() {
            old.mark_obsolete();
        }
        tracing::info!(
            "Compacted {}: {} segments -> 1 ({} -> {} records)",
            self.key,
            current.file_count(),
            current.record_count(),
            info.record_count
        );
        Ok(Some(info))
    }

    /// 记录一次更新的元数据事务及其效果；不比当前事务新的直接忽略（返回 false）
    pub fn apply_metadata(&self, txn: MetadataTransaction, change: MetadataChange) -> Result<bool> {
        let _g = self.commit_lock.lock();
        let current = self.head.load_full();
        if txn <= current.metadata_txn() {
            tracing::debug!(
                "Ignoring stale metadata txn {} (seq {}) for {}, last applied seq {}",
                txn.transaction_id,
                txn.sequence,
                self.key,
                current.metadata_txn().sequence
            );
            return Ok(false);
        }

        let mut next = current.successor();
        next.metadata_txn = txn;
        match change {
            MetadataChange::BeginSplit { split_partition_ids } => {
                if split_partition_ids.len() < 2 {
                    return Err(self.commit_failed(
                        "apply metadata",
                        "split needs at least two target partitions",
                    ));
                }
                next.is_splitting = true;
                next.split_partition_ids = split_partition_ids;
            }
            MetadataChange::FinishSplit => {
                next.is_splitting = false;
                next.split_partition_ids.clear();
            }
            MetadataChange::SetKeyRange(range) => {
                if !range.is_valid() {
                    return Err(self.commit_failed("apply metadata", "invalid key range"));
                }
                next.keyrange = range;
            }
            MetadataChange::SetReplicationTargets(targets) => {
                next.replication_targets = targets;
            }
        }

        self.descriptor
            .write_atomic(&next.to_descriptor())
            .map_err(|e| self.commit_failed("apply metadata", e))?;
        self.publish(next, "metadata");
        Ok(true)
    }

    fn publish(&self, next: PartitionSnapshot, op: &'static str) -> CommitInfo {
        let info = CommitInfo::of(&next);
        self.head.store(Arc::new(next));
        tracing::info!(
            "Published {} v{} ({}): {} files, {} records, {} bytes",
            self.key,
            info.version,
            op,
            info.file_count,
            info.record_count,
            info.total_size
        );
        info
    }

    fn commit_failed(&self, op: &'static str, err: impl std::fmt::Display) -> PartitionError {
        tracing::warn!("Commit {} failed for {}, keeping current snapshot: {}", op, self.key, err);
        PartitionError::CommitFailed {
            key: self.key.clone(),
            reason: format!("{}: {}", op, err),
        }
    }
}

/// 清理崩溃遗留：*.tmp 与当前快照未引用的段文件（best-effort）
fn gc_orphans(dir: &Path, current: &PartitionSnapshot) -> usize {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0usize;
    for ent in rd {
        let Ok(ent) = ent else { continue };
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_tmp = name.ends_with(".tmp");
        let is_orphan_segment = parse_segment_version(name).is_some()
            && !current.segments().iter().any(|s| s.name() == name);
        if (is_tmp || is_orphan_segment) && std::fs::remove_file(ent.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
