//! 复制策略。
//!
//! 策略由表配置与快照中的副本目标经纯函数 `select_strategy` 选出，是一个枚举而不是 trait 对象层级。
//! 所有变体遵守同一契约：把构造时刻的快照数据传给对端，使完整接收的对端能 `reopen` 出等价分区。
//! 复制从不修改本地分区状态；传输是阻塞 I/O，调用方不应在持锁路径上执行。

pub mod local;

use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::core::{PartitionKey, PlacementPolicy, Table};
use crate::error::{PartitionError, Result};
use crate::partition::PartitionSnapshot;
use crate::storage::SnapshotDescriptor;

pub use local::LocalConnectionPool;

/// 连接池 / 传输层：只要求能按节点寻址并搬运字节
pub trait ConnectionPool: Send + Sync {
    /// 对端持有的该分区快照版本；对端没有该分区时为 `None`
    fn peer_version(&self, peer: &str, key: &PartitionKey) -> Result<Option<u64>>;

    fn send(&self, peer: &str, transfer: &SnapshotTransfer) -> Result<()>;
}

/// 一次传输的载荷：descriptor + 全部段文件字节
#[derive(Clone, Debug)]
pub struct SnapshotTransfer {
    pub descriptor: SnapshotDescriptor,
    pub segments: Vec<(String, Vec<u8>)>,
}

impl SnapshotTransfer {
    pub fn from_snapshot(snapshot: &PartitionSnapshot) -> Result<Self> {
        let mut segments = Vec::with_capacity(snapshot.file_count());
        for seg in snapshot.segments() {
            let bytes = std::fs::read(seg.path()).map_err(|e| PartitionError::io("read segment for transfer", e))?;
            segments.push((seg.name().to_string(), bytes));
        }
        Ok(Self {
            descriptor: snapshot.to_descriptor(),
            segments,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(|(_, b)| b.len()).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    None,
    LeaderPush,
    PeerPull,
}

/// 纯函数：由表配置、快照里的副本目标与本节点 id 决定策略
pub fn select_strategy(table: &Table, snapshot: &PartitionSnapshot, local_node: &str) -> StrategyKind {
    if table.replication_factor() <= 1 || remote_peers(table, snapshot, local_node).is_empty() {
        return StrategyKind::None;
    }
    match table.placement() {
        PlacementPolicy::PeerPull => StrategyKind::PeerPull,
        PlacementPolicy::LeaderPush => {
            if is_leader(snapshot, local_node) {
                StrategyKind::LeaderPush
            } else {
                StrategyKind::None
            }
        }
    }
}

/// 没有显式 leader 时，第一个目标即 leader
fn is_leader(snapshot: &PartitionSnapshot, local_node: &str) -> bool {
    let targets = snapshot.replication_targets();
    match targets.iter().find(|t| t.is_leader) {
        Some(t) => t.node_id == local_node,
        None => targets.first().is_some_and(|t| t.node_id == local_node),
    }
}

/// 除本节点外的目标，最多 factor - 1 个
fn remote_peers(table: &Table, snapshot: &PartitionSnapshot, local_node: &str) -> Vec<String> {
    let max = table.replication_factor().saturating_sub(1) as usize;
    snapshot
        .replication_targets()
        .iter()
        .filter(|t| t.node_id != local_node)
        .take(max)
        .map(|t| t.node_id.clone())
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub version: u64,
    pub sent: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct LeaderPush {
    snapshot: Arc<PartitionSnapshot>,
    peers: Vec<String>,
    pool: Arc<dyn ConnectionPool>,
    /// 扇出线程池，随策略构造一次，多次 `replicate` 复用
    workers: rayon::ThreadPool,
}

pub struct PeerPull {
    snapshot: Arc<PartitionSnapshot>,
    peers: Vec<String>,
    pool: Arc<dyn ConnectionPool>,
}

pub enum PartitionReplication {
    NoReplication { snapshot: Arc<PartitionSnapshot> },
    LeaderPush(LeaderPush),
    PeerPull(PeerPull),
}

impl PartitionReplication {
    pub fn new(
        snapshot: Arc<PartitionSnapshot>,
        table: &Table,
        config: &ServerConfig,
        pool: Arc<dyn ConnectionPool>,
    ) -> Result<Self> {
        let kind = select_strategy(table, &snapshot, &config.node_id);
        let peers = remote_peers(table, &snapshot, &config.node_id);
        tracing::debug!(
            "Replication strategy for {}: {:?} (peers={:?})",
            snapshot.key(),
            kind,
            peers
        );
        Ok(match kind {
            StrategyKind::None => PartitionReplication::NoReplication { snapshot },
            StrategyKind::LeaderPush => {
                let threads = config.replication.parallelism.min(peers.len()).max(1);
                let workers = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("replicate-{i}"))
                    .build()
                    .map_err(|e| PartitionError::ReplicationTransfer {
                        peers: peers.clone(),
                        reason: format!("cannot start transfer workers: {}", e),
                    })?;
                PartitionReplication::LeaderPush(LeaderPush {
                    snapshot,
                    peers,
                    pool,
                    workers,
                })
            }
            StrategyKind::PeerPull => PartitionReplication::PeerPull(PeerPull { snapshot, peers, pool }),
        })
    }

    /// LeaderPush 的扇出线程数；其他策略为 0
    pub fn worker_threads(&self) -> usize {
        match self {
            PartitionReplication::LeaderPush(s) => s.workers.current_num_threads(),
            _ => 0,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            PartitionReplication::NoReplication { .. } => StrategyKind::None,
            PartitionReplication::LeaderPush(_) => StrategyKind::LeaderPush,
            PartitionReplication::PeerPull(_) => StrategyKind::PeerPull,
        }
    }

    pub fn snapshot(&self) -> &Arc<PartitionSnapshot> {
        match self {
            PartitionReplication::NoReplication { snapshot } => snapshot,
            PartitionReplication::LeaderPush(s) => &s.snapshot,
            PartitionReplication::PeerPull(s) => &s.snapshot,
        }
    }

    pub fn peers(&self) -> &[String] {
        match self {
            PartitionReplication::NoReplication { .. } => &[],
            PartitionReplication::LeaderPush(s) => &s.peers,
            PartitionReplication::PeerPull(s) => &s.peers,
        }
    }

    /// 执行复制。任一对端失败时，在尝试完全部对端后返回 `ReplicationTransfer`
    pub fn replicate(&self) -> Result<ReplicationReport> {
        match self {
            PartitionReplication::NoReplication { snapshot } => Ok(ReplicationReport {
                version: snapshot.version(),
                ..ReplicationReport::default()
            }),
            PartitionReplication::LeaderPush(s) => s.replicate(),
            PartitionReplication::PeerPull(s) => s.replicate(),
        }
    }
}

impl LeaderPush {
    /// 并行推送给全部对端，覆盖对端已有版本
    fn replicate(&self) -> Result<ReplicationReport> {
        let transfer = SnapshotTransfer::from_snapshot(&self.snapshot)?;
        let results: Vec<(String, Result<()>)> = self.workers.install(|| {
            self.peers
                .par_iter()
                .map(|peer| (peer.clone(), self.pool.send(peer, &transfer)))
                .collect()
        });

        let mut report = ReplicationReport {
            version: self.snapshot.version(),
            ..ReplicationReport::default()
        };
        let mut failures = Vec::new();
        for (peer, res) in results {
            match res {
                Ok(()) => report.sent.push(peer),
                Err(e) => failures.push((peer, e)),
            }
        }
        tracing::info!(
            "LeaderPush {} v{}: {} bytes to {} peers, {} failed",
            self.snapshot.key(),
            report.version,
            transfer.byte_len(),
            report.sent.len(),
            failures.len()
        );
        finish(report, failures)
    }
}

impl PeerPull {
    /// 逐个对端比较版本，只补齐落后的对端；对端版本不低于本地时跳过
    fn replicate(&self) -> Result<ReplicationReport> {
        let key = self.snapshot.key();
        let version = self.snapshot.version();
        let mut report = ReplicationReport {
            version,
            ..ReplicationReport::default()
        };
        let mut failures = Vec::new();
        let mut transfer: Option<SnapshotTransfer> = None;

        for peer in &self.peers {
            match self.pool.peer_version(peer, key) {
                Ok(Some(v)) if v >= version => {
                    tracing::debug!("PeerPull {}: {} already at v{} (local v{})", key, peer, v, version);
                    report.skipped.push(peer.clone());
                }
                Ok(_) => {
                    if transfer.is_none() {
                        transfer = Some(SnapshotTransfer::from_snapshot(&self.snapshot)?);
                    }
                    let Some(t) = transfer.as_ref() else { continue };
                    match self.pool.send(peer, t) {
                        Ok(()) => report.sent.push(peer.clone()),
                        Err(e) => failures.push((peer.clone(), e)),
                    }
                }
                Err(e) => failures.push((peer.clone(), e)),
            }
        }

        tracing::info!(
            "PeerPull {} v{}: sent={:?} skipped={:?} failed={}",
            key,
            version,
            report.sent,
            report.skipped,
            failures.len()
        );
        finish(report, failures)
    }
}

fn finish(report: ReplicationReport, failures: Vec<(String, PartitionError)>) -> Result<ReplicationReport> {
    let Some((_, first)) = failures.first() else {
        return Ok(report);
    };
    let reason = first.to_string();
    for (peer, e) in &failures {
        tracing::warn!("Replication of v{} to {} failed: {}", report.version, peer, e);
    }
    Err(PartitionError::ReplicationTransfer {
        peers: failures.into_iter().map(|(p, _)| p).collect(),
        reason,
    })
}
