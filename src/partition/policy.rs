use crate::config::LsmPolicy;
use crate::core::Table;
use crate::partition::snapshot::PartitionSnapshot;
use crate::storage::StorageFormat;

/// 是否按 LSMv2 布局对待该分区。纯函数：只看快照形状与配置，读路径可以放心分支。
///
/// - 已经是 LSMv2 的分区保持 LSMv2（不回退）
/// - 服务端策略或表关闭 LSM、或分区正在切分时，保持旧布局
/// - 否则段数或总大小任一达到阈值即升级
pub fn upgrade_to_lsm_v2(snapshot: &PartitionSnapshot, table: &Table, policy: &LsmPolicy) -> bool {
    if snapshot.format() == StorageFormat::LsmV2 {
        return true;
    }
    if !policy.enabled || !table.config.lsm_enabled || snapshot.is_splitting() {
        return false;
    }
    snapshot.file_count() >= policy.min_files || snapshot.total_size() >= policy.min_size_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DiscoveryInfo, PartitionId, PartitionKey, TableConfig};
    use crate::partition::snapshot::SegmentHandle;
    use std::sync::Arc;

    fn snapshot_with(files: usize, bytes_each: u64) -> PartitionSnapshot {
        let dir = std::env::temp_dir();
        let key = PartitionKey::new("a", "events", PartitionId::compute(b"p"));
        let mut snap = PartitionSnapshot::initial(key, dir.clone(), &DiscoveryInfo::serve("n"));
        for i in 0..files {
            snap.segments.push(Arc::new(SegmentHandle::new(&dir, format!("x-{i}"), bytes_each, 1)));
        }
        snap.recompute_totals();
        snap
    }

    fn policy(min_files: usize, min_size_bytes: u64) -> LsmPolicy {
        LsmPolicy {
            enabled: true,
            min_files,
            min_size_bytes,
        }
    }

    #[test]
    fn thresholds_trigger_upgrade() {
        let table = Table::new("a", "events", TableConfig::default());
        let p = policy(3, 1000);

        assert!(!upgrade_to_lsm_v2(&snapshot_with(2, 10), &table, &p));
        assert!(upgrade_to_lsm_v2(&snapshot_with(3, 10), &table, &p));
        assert!(upgrade_to_lsm_v2(&snapshot_with(1, 1000), &table, &p));
    }

    #[test]
    fn disabled_or_splitting_stays_legacy() {
        let mut cfg = TableConfig::default();
        cfg.lsm_enabled = false;
        let off_table = Table::new("a", "events", cfg);
        let on_table = Table::new("a", "events", TableConfig::default());
        let big = snapshot_with(10, 10_000);

        assert!(!upgrade_to_lsm_v2(&big, &off_table, &policy(1, 1)));
        let mut off = policy(1, 1);
        off.enabled = false;
        assert!(!upgrade_to_lsm_v2(&big, &on_table, &off));

        let mut splitting = big.clone();
        splitting.is_splitting = true;
        assert!(!upgrade_to_lsm_v2(&splitting, &on_table, &policy(1, 1)));
    }

    #[test]
    fn upgraded_partition_never_downgrades() {
        let table = Table::new("a", "events", TableConfig::default());
        let mut snap = snapshot_with(0, 0);
        snap.format = StorageFormat::LsmV2;
        assert!(upgrade_to_lsm_v2(&snap, &table, &policy(100, u64::MAX)));
    }

    #[test]
    fn deterministic() {
        let table = Table::new("a", "events", TableConfig::default());
        let snap = snapshot_with(4, 100);
        let p = policy(4, u64::MAX);
        let first = upgrade_to_lsm_v2(&snap, &table, &p);
        for _ in 0..10 {
            assert_eq!(upgrade_to_lsm_v2(&snap, &table, &p), first);
        }
    }
}
