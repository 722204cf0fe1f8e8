use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::core::key::validate_dir_name;
use crate::core::PartitionKey;
use crate::error::{PartitionError, Result};
use crate::replication::{ConnectionPool, SnapshotTransfer};
use crate::storage::descriptor::DescriptorStore;
use crate::storage::segment::{install_segment_bytes, parse_segment_version};

/// 进程内连接池：节点 id → 该节点的数据目录。
///
/// 用于单机多目录部署和测试；落地顺序与本地提交一致：先装段，再原子替换 descriptor，最后清理无引用段。
#[derive(Default)]
pub struct LocalConnectionPool {
    nodes: DashMap<String, PathBuf>,
    transfers: AtomicU64,
}

impl LocalConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, data_dir: impl Into<PathBuf>) {
        self.nodes.insert(node_id.to_string(), data_dir.into());
    }

    pub fn unregister(&self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// 成功落地的传输次数
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    fn partition_dir(&self, peer: &str, key: &PartitionKey) -> Result<PathBuf> {
        // key 来自对端 descriptor，必须落在对端数据目录内
        validate_dir_name("namespace", &key.namespace)?;
        validate_dir_name("table", &key.table)?;
        let root = self
            .nodes
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| PartitionError::ReplicationTransfer {
                peers: vec![peer.to_string()],
                reason: "peer not registered".to_string(),
            })?;
        Ok(root.join(key.relative_path()))
    }
}

impl ConnectionPool for LocalConnectionPool {
    fn peer_version(&self, peer: &str, key: &PartitionKey) -> Result<Option<u64>> {
        let dir = self.partition_dir(peer, key)?;
        Ok(DescriptorStore::in_dir(&dir).load()?.map(|d| d.version))
    }

    fn send(&self, peer: &str, transfer: &SnapshotTransfer) -> Result<()> {
        let dir = self.partition_dir(peer, &transfer.descriptor.key)?;
        std::fs::create_dir_all(&dir).map_err(|e| PartitionError::io("create peer partition dir", e))?;

        for (name, bytes) in &transfer.segments {
            install_segment_bytes(&dir.join(name), bytes)?;
        }
        DescriptorStore::in_dir(&dir).write_atomic(&transfer.descriptor)?;

        let removed = remove_unreferenced(&dir, transfer);
        self.transfers.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Installed {} v{} on {} ({} segments, {} stale removed)",
            transfer.descriptor.key,
            transfer.descriptor.version,
            peer,
            transfer.segments.len(),
            removed
        );
        Ok(())
    }
}

fn remove_unreferenced(dir: &Path, transfer: &SnapshotTransfer) -> usize {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for ent in rd.flatten() {
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        let referenced = transfer.descriptor.segments.iter().any(|s| s.name == name);
        if parse_segment_version(name).is_some() && !referenced && std::fs::remove_file(ent.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PartitionId;

    #[test]
    fn unknown_peer_is_transfer_error() {
        let pool = LocalConnectionPool::new();
        let key = PartitionKey::new("a", "t", PartitionId::compute(b"x"));
        let err = pool.peer_version("ghost", &key).unwrap_err();
        assert!(matches!(err, PartitionError::ReplicationTransfer { .. }));
    }

    #[test]
    fn registered_peer_without_partition_has_no_version() {
        let dir = tempfile::tempdir().unwrap();
        let pool = LocalConnectionPool::new();
        pool.register("b", dir.path());
        let key = PartitionKey::new("a", "t", PartitionId::compute(b"x"));
        assert_eq!(pool.peer_version("b", &key).unwrap(), None);
        assert!(pool.unregister("b"));
        assert!(!pool.unregister("b"));
    }
}
