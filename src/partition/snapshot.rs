//! 分区的不可变快照。
//!
//! 快照一经发布就不再修改，只会被新快照取代。多个读者通过 `Arc` 共享同一快照；
//! 段文件由 `SegmentHandle` 引用计数，被 compaction 取代的段只在最后一个引用它的快照
//! 释放时才物理删除，所以持有旧快照的读者始终能读到完整数据。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::{DiscoveryInfo, KeyRange, MetadataTransaction, PartitionId, PartitionKey, ReplicationTarget};
use crate::error::{PartitionError, Result};
use crate::storage::{SegmentDescriptor, SnapshotDescriptor, StorageFormat};

/// 已发布的段文件
#[derive(Debug)]
pub struct SegmentHandle {
    name: String,
    path: PathBuf,
    size_bytes: u64,
    record_count: u64,
    obsolete: AtomicBool,
}

impl SegmentHandle {
    pub(crate) fn new(dir: &Path, name: String, size_bytes: u64, record_count: u64) -> Self {
        Self {
            path: dir.join(&name),
            name,
            size_bytes,
            record_count,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// 标记为已被取代：最后一个引用释放时删除文件
    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            name: self.name.clone(),
            size_bytes: self.size_bytes,
            record_count: self.record_count,
        }
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Removed superseded segment {}", self.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Failed to remove superseded segment {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

/// 某一时刻已提交的分区状态
#[derive(Clone, Debug)]
pub struct PartitionSnapshot {
    pub(crate) key: PartitionKey,
    pub(crate) dir: PathBuf,
    pub(crate) version: u64,
    pub(crate) segments: Vec<Arc<SegmentHandle>>,
    pub(crate) total_size: u64,
    pub(crate) record_count: u64,
    pub(crate) metadata_txn: MetadataTransaction,
    pub(crate) keyrange: KeyRange,
    pub(crate) replication_targets: Vec<ReplicationTarget>,
    pub(crate) is_splitting: bool,
    pub(crate) split_partition_ids: Vec<PartitionId>,
    pub(crate) format: StorageFormat,
    pub(crate) created_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PartitionSnapshot {
    /// create 路径：由 discovery 响应构造 version 0 的空快照
    pub(crate) fn initial(key: PartitionKey, dir: PathBuf, discovery: &DiscoveryInfo) -> Self {
        Self {
            key,
            dir,
            version: 0,
            segments: Vec::new(),
            total_size: 0,
            record_count: 0,
            metadata_txn: discovery.txn,
            keyrange: discovery.keyrange.clone(),
            replication_targets: discovery.replication_targets.clone(),
            is_splitting: discovery.is_splitting,
            split_partition_ids: discovery.split_partition_ids.clone(),
            format: StorageFormat::Legacy,
            created_at_ms: now_ms(),
        }
    }

    /// reopen 路径：descriptor 引用的段文件必须都在
    pub(crate) fn from_descriptor(dir: PathBuf, desc: SnapshotDescriptor) -> Result<Self> {
        let mut segments = Vec::with_capacity(desc.segments.len());
        for s in desc.segments {
            let handle = SegmentHandle::new(&dir, s.name, s.size_bytes, s.record_count);
            if !handle.path().is_file() {
                return Err(PartitionError::corrupt(
                    handle.path(),
                    format!("segment referenced by descriptor v{} is missing", desc.version),
                ));
            }
            segments.push(Arc::new(handle));
        }

        let mut snap = Self {
            key: desc.key,
            dir,
            version: desc.version,
            segments,
            total_size: 0,
            record_count: 0,
            metadata_txn: desc.metadata_txn,
            keyrange: desc.keyrange,
            replication_targets: desc.replication_targets,
            is_splitting: desc.is_splitting,
            split_partition_ids: desc.split_partition_ids,
            format: desc.format,
            created_at_ms: desc.created_at_ms,
        };
        snap.recompute_totals();
        Ok(snap)
    }

    pub fn to_descriptor(&self) -> SnapshotDescriptor {
        SnapshotDescriptor {
            key: self.key.clone(),
            version: self.version,
            segments: self.segments.iter().map(|s| s.descriptor()).collect(),
            metadata_txn: self.metadata_txn,
            keyrange: self.keyrange.clone(),
            replication_targets: self.replication_targets.clone(),
            is_splitting: self.is_splitting,
            split_partition_ids: self.split_partition_ids.clone(),
            format: self.format,
            created_at_ms: self.created_at_ms,
        }
    }

    /// 下一个版本的工作副本（共享段句柄）；只有 writer 会调用
    pub(crate) fn successor(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.created_at_ms = now_ms();
        next
    }

    pub(crate) fn recompute_totals(&mut self) {
        self.total_size = self.segments.iter().map(|s| s.size_bytes()).sum();
        self.record_count = self.segments.iter().map(|s| s.record_count()).sum();
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn segments(&self) -> &[Arc<SegmentHandle>] {
        &self.segments
    }

    pub fn file_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn metadata_txn(&self) -> MetadataTransaction {
        self.metadata_txn
    }

    pub fn keyrange(&self) -> &KeyRange {
        &self.keyrange
    }

    pub fn replication_targets(&self) -> &[ReplicationTarget] {
        &self.replication_targets
    }

    pub fn is_splitting(&self) -> bool {
        self.is_splitting
    }

    pub fn split_partition_ids(&self) -> &[PartitionId] {
        &self.split_partition_ids
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obsolete_segment_removed_on_last_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0000000000000001.dat");
        std::fs::write(&path, b"x").unwrap();

        let handle = Arc::new(SegmentHandle::new(dir.path(), "seg-0000000000000001.dat".into(), 1, 0));
        let held_by_reader = handle.clone();
        handle.mark_obsolete();
        drop(handle);
        assert!(path.exists());
        drop(held_by_reader);
        assert!(!path.exists());
    }

    #[test]
    fn live_segment_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0000000000000002.dat");
        std::fs::write(&path, b"x").unwrap();
        drop(SegmentHandle::new(dir.path(), "seg-0000000000000002.dat".into(), 1, 0));
        assert!(path.exists());
    }

    #[test]
    fn descriptor_with_missing_segment_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let key = PartitionKey::new("a", "events", PartitionId::compute(b"h"));
        let mut snap = PartitionSnapshot::initial(
            key,
            dir.path().to_path_buf(),
            &DiscoveryInfo::serve("node-a"),
        );
        snap.segments.push(Arc::new(SegmentHandle::new(dir.path(), "seg-0000000000000001.dat".into(), 10, 1)));
        let desc = snap.to_descriptor();

        let err = PartitionSnapshot::from_descriptor(dir.path().to_path_buf(), desc).unwrap_err();
        assert!(matches!(err, PartitionError::CorruptState { .. }));
    }

    #[test]
    fn successor_bumps_version_and_shares_segments() {
        let dir = tempfile::tempdir().unwrap();
        let key = PartitionKey::new("a", "events", PartitionId::compute(b"h"));
        let mut snap = PartitionSnapshot::initial(key, dir.path().to_path_buf(), &DiscoveryInfo::serve("n"));
        snap.segments.push(Arc::new(SegmentHandle::new(dir.path(), "s".into(), 10, 2)));
        snap.recompute_totals();

        let next = snap.successor();
        assert_eq!(next.version(), snap.version() + 1);
        assert!(Arc::ptr_eq(&next.segments()[0], &snap.segments()[0]));
        assert_eq!(next.total_size(), 10);
        assert_eq!(next.record_count(), 2);
    }
}
