use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::key::{KeyRange, PartitionId};
use crate::error::{PartitionError, Result};

/// 元数据事务标记：分区只记录最近一次已应用的事务
///
/// 全序：先比 sequence，再比 transaction_id。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataTransaction {
    pub transaction_id: PartitionId,
    pub sequence: u64,
}

impl MetadataTransaction {
    pub fn new(transaction_id: PartitionId, sequence: u64) -> Self {
        Self {
            transaction_id,
            sequence,
        }
    }

    pub fn initial() -> Self {
        Self {
            transaction_id: PartitionId::from_bytes([0u8; 20]),
            sequence: 0,
        }
    }
}

impl Ord for MetadataTransaction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.transaction_id.cmp(&other.transaction_id))
    }
}

impl PartialOrd for MetadataTransaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryCode {
    Unknown,
    Load,
    Serve,
    Unload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub node_id: String,
    #[serde(default)]
    pub is_leader: bool,
}

impl ReplicationTarget {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            is_leader: false,
        }
    }

    pub fn leader(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            is_leader: true,
        }
    }
}

/// 协调服务下发的放置/归属信息，仅在 create 时使用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub code: DiscoveryCode,
    pub txn: MetadataTransaction,
    #[serde(default)]
    pub keyrange: KeyRange,
    #[serde(default)]
    pub replication_targets: Vec<ReplicationTarget>,
    #[serde(default)]
    pub is_splitting: bool,
    #[serde(default)]
    pub split_partition_ids: Vec<PartitionId>,
}

impl DiscoveryInfo {
    /// 单节点、无切分的 serve 响应
    pub fn serve(node_id: impl Into<String>) -> Self {
        Self {
            code: DiscoveryCode::Serve,
            txn: MetadataTransaction::initial(),
            keyrange: KeyRange::unbounded(),
            replication_targets: vec![ReplicationTarget::leader(node_id)],
            is_splitting: false,
            split_partition_ids: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(PartitionError::InvalidDiscoveryInfo { reason });

        match self.code {
            DiscoveryCode::Load | DiscoveryCode::Serve => {}
            other => return invalid(format!("discovery code {:?} cannot create a partition", other)),
        }

        if !self.keyrange.is_valid() {
            return invalid(format!(
                "key range begin {:?} is not below end {:?}",
                self.keyrange.begin, self.keyrange.end
            ));
        }

        let mut seen = HashSet::new();
        let mut leaders = 0usize;
        for t in &self.replication_targets {
            if t.node_id.is_empty() {
                return invalid("replication target with empty node id".to_string());
            }
            if !seen.insert(t.node_id.as_str()) {
                return invalid(format!("duplicate replication target {}", t.node_id));
            }
            if t.is_leader {
                leaders += 1;
            }
        }
        if leaders > 1 {
            return invalid(format!("{} replication targets marked as leader", leaders));
        }

        if self.is_splitting && self.split_partition_ids.len() < 2 {
            return invalid("split in progress but fewer than two split partitions".to_string());
        }
        if !self.is_splitting && !self.split_partition_ids.is_empty() {
            return invalid("split partitions listed but no split in progress".to_string());
        }

        Ok(())
    }
}

/// 与一次元数据事务一起落到分区上的变更
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataChange {
    BeginSplit { split_partition_ids: Vec<PartitionId> },
    FinishSplit,
    SetKeyRange(KeyRange),
    SetReplicationTargets(Vec<ReplicationTarget>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(seq: u64) -> MetadataTransaction {
        MetadataTransaction::new(PartitionId::compute(&seq.to_le_bytes()), seq)
    }

    #[test]
    fn transactions_order_by_sequence() {
        assert!(txn(1) < txn(2));
        assert!(MetadataTransaction::initial() < txn(1));
        assert_eq!(txn(3).max(txn(2)), txn(3));
    }

    #[test]
    fn serve_response_is_valid() {
        assert!(DiscoveryInfo::serve("node-a").validate().is_ok());
    }

    #[test]
    fn rejects_structurally_invalid_payloads() {
        let base = DiscoveryInfo::serve("node-a");

        let mut d = base.clone();
        d.code = DiscoveryCode::Unknown;
        assert!(matches!(d.validate(), Err(PartitionError::InvalidDiscoveryInfo { .. })));

        let mut d = base.clone();
        d.keyrange = KeyRange::new("m", "a");
        assert!(d.validate().is_err());

        let mut d = base.clone();
        d.replication_targets.push(ReplicationTarget::new(""));
        assert!(d.validate().is_err());

        let mut d = base.clone();
        d.replication_targets.push(ReplicationTarget::new("node-a"));
        assert!(d.validate().is_err());

        let mut d = base.clone();
        d.replication_targets.push(ReplicationTarget::leader("node-b"));
        assert!(d.validate().is_err());

        let mut d = base.clone();
        d.is_splitting = true;
        d.split_partition_ids = vec![PartitionId::compute(b"l")];
        assert!(d.validate().is_err());

        let mut d = base;
        d.split_partition_ids = vec![PartitionId::compute(b"l"), PartitionId::compute(b"r")];
        assert!(d.validate().is_err());
        d.is_splitting = true;
        assert!(d.validate().is_ok());
    }
}
