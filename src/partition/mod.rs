pub mod lazy;
pub mod policy;
pub mod reader;
pub mod snapshot;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::core::{
    DiscoveryInfo, KeyRange, MetadataTransaction, PartitionId, PartitionKey, ReplicationTarget, Table,
};
use crate::error::{PartitionError, Result};
use crate::replication::{ConnectionPool, PartitionReplication};
use crate::storage::{DescriptorStore, StorageFormat};

pub use lazy::{LazyPartition, PartitionResolver};
pub use policy::upgrade_to_lsm_v2;
pub use reader::PartitionReader;
pub use snapshot::{PartitionSnapshot, SegmentHandle};
pub use writer::{CommitInfo, PartitionWriter};

/// 状态查询用的只读摘要（不拿 writer 锁）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub namespace: String,
    pub table: String,
    pub partition_id: PartitionId,
    pub uuid: PartitionId,
    pub version: u64,
    pub file_count: usize,
    pub record_count: u64,
    pub total_size: u64,
    pub metadata_txn: MetadataTransaction,
    pub keyrange: KeyRange,
    pub replication_targets: Vec<ReplicationTarget>,
    pub is_splitting: bool,
    pub format: StorageFormat,
    pub lsm_v2: bool,
    pub path: PathBuf,
}

/// 分区聚合根
///
/// - head：当前快照，`ArcSwap` 原子替换，读路径无锁
/// - writer：首次调用 `writer()` 时创建，每个分区至多一个
/// - config：共享只读，活得比分区久
pub struct Partition {
    key: PartitionKey,
    dir: PathBuf,
    table: Arc<Table>,
    config: Arc<ServerConfig>,
    head: Arc<ArcSwap<PartitionSnapshot>>,
    writer: Mutex<Option<Arc<PartitionWriter>>>,
}

impl Partition {
    fn new(key: PartitionKey, table: Arc<Table>, config: Arc<ServerConfig>, snapshot: PartitionSnapshot) -> Self {
        Self {
            dir: snapshot.dir().to_path_buf(),
            key,
            table,
            config,
            head: Arc::new(ArcSwap::from_pointee(snapshot)),
            writer: Mutex::new(None),
        }
    }

    /// 由 discovery 响应新建分区（version 0，无段文件）
    pub fn create(
        namespace: &str,
        table: Arc<Table>,
        partition_id: PartitionId,
        discovery: &DiscoveryInfo,
        config: Arc<ServerConfig>,
    ) -> Result<Arc<Partition>> {
        discovery.validate()?;

        let key = PartitionKey::checked(namespace, &table.name, partition_id)?;
        let dir = config.data_dir.join(key.relative_path());
        std::fs::create_dir_all(&dir).map_err(|e| PartitionError::io("create partition dir", e))?;

        let snapshot = PartitionSnapshot::initial(key.clone(), dir.clone(), discovery);
        let store = DescriptorStore::in_dir(&dir);
        if !store.create_new(&snapshot.to_descriptor())? {
            return Err(PartitionError::AlreadyExists { key });
        }

        tracing::info!(
            "Created partition {} (txn seq {}, {} replication targets)",
            key,
            discovery.txn.sequence,
            discovery.replication_targets.len()
        );
        Ok(Arc::new(Self::new(key, table, config, snapshot)))
    }

    /// 从磁盘 descriptor 重新打开
    pub fn reopen(
        namespace: &str,
        table: Arc<Table>,
        partition_id: PartitionId,
        config: Arc<ServerConfig>,
    ) -> Result<Arc<Partition>> {
        let key = PartitionKey::checked(namespace, &table.name, partition_id)?;
        let dir = config.data_dir.join(key.relative_path());
        let store = DescriptorStore::in_dir(&dir);

        let desc = store.load()?.ok_or_else(|| PartitionError::NotFound { key: key.clone() })?;
        if desc.key != key {
            return Err(PartitionError::corrupt(
                store.path(),
                format!("descriptor belongs to {}, expected {}", desc.key, key),
            ));
        }
        let snapshot = PartitionSnapshot::from_descriptor(dir, desc)?;

        tracing::info!(
            "Reopened partition {} v{}: {} files, {} records",
            key,
            snapshot.version(),
            snapshot.file_count(),
            snapshot.record_count()
        );
        Ok(Arc::new(Self::new(key, table, config, snapshot)))
    }

    pub fn partition_id(&self) -> PartitionId {
        self.key.partition_id
    }

    pub fn uuid(&self) -> PartitionId {
        self.key.uuid()
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// 当前快照；返回的引用在后续提交后依然有效且不变
    pub fn snapshot(&self) -> Arc<PartitionSnapshot> {
        self.head.load_full()
    }

    /// 绑定到调用时刻快照的读者
    pub fn reader(&self) -> PartitionReader {
        PartitionReader::new(self.snapshot())
    }

    /// 返回唯一的 writer，首次调用时创建
    pub fn writer(&self) -> Result<Arc<PartitionWriter>> {
        let mut g = self.writer.lock();
        if let Some(w) = g.as_ref() {
            return Ok(w.clone());
        }
        let w = Arc::new(PartitionWriter::open(
            self.key.clone(),
            self.dir.clone(),
            self.head.clone(),
            self.table.clone(),
            self.config.clone(),
        )?);
        tracing::debug!("Writer created for {}", self.key);
        *g = Some(w.clone());
        Ok(w)
    }

    pub fn info(&self) -> PartitionInfo {
        let snap = self.head.load();
        PartitionInfo {
            namespace: self.key.namespace.clone(),
            table: self.key.table.clone(),
            partition_id: self.key.partition_id,
            uuid: self.uuid(),
            version: snap.version(),
            file_count: snap.file_count(),
            record_count: snap.record_count(),
            total_size: snap.total_size(),
            metadata_txn: snap.metadata_txn(),
            keyrange: snap.keyrange().clone(),
            replication_targets: snap.replication_targets().to_vec(),
            is_splitting: snap.is_splitting(),
            format: snap.format(),
            lsm_v2: upgrade_to_lsm_v2(&snap, &self.table, &self.config.lsm),
            path: self.dir.clone(),
        }
    }

    /// 按表配置与当前快照选择复制策略，绑定到给定连接池
    pub fn replication_strategy(&self, pool: Arc<dyn ConnectionPool>) -> Result<PartitionReplication> {
        PartitionReplication::new(self.snapshot(), &self.table, &self.config, pool)
    }

    pub fn relative_path(&self) -> PathBuf {
        self.key.relative_path()
    }

    pub fn absolute_path(&self) -> &Path {
        &self.dir
    }

    pub fn last_metadata_transaction(&self) -> MetadataTransaction {
        self.head.load().metadata_txn()
    }

    pub fn total_disk_size(&self) -> u64 {
        self.head.load().total_size()
    }

    pub fn is_splitting(&self) -> bool {
        self.head.load().is_splitting()
    }

    pub fn upgrade_to_lsm_v2(&self) -> bool {
        upgrade_to_lsm_v2(&self.head.load(), &self.table, &self.config.lsm)
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("key", &self.key)
            .field("version", &self.head.load().version())
            .finish()
    }
}
