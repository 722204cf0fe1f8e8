use std::sync::{Arc, OnceLock};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::core::{PartitionId, Table};
use crate::error::{PartitionError, Result};
use crate::partition::Partition;

/// 把 (namespace, table, partition_id) 解析为已加载的分区（通常由 `PartitionMap` 实现）
pub trait PartitionResolver: Send + Sync {
    fn resolve(
        &self,
        namespace: &str,
        table: &Arc<Table>,
        partition_id: &PartitionId,
        config: &Arc<ServerConfig>,
    ) -> Result<Arc<Partition>>;
}

/// 一次加载尝试的结果槽：失败时写入错误，随后由新的槽取代
#[derive(Default)]
struct LoadAttempt {
    error: OnceLock<PartitionError>,
}

/// 延迟加载的分区：Unloaded → Loaded（Loaded 为终态）
///
/// 快路径无锁（`ArcSwapOption`）；慢路径持锁 double-check，保证并发首访时只解析一次。
/// 调用者在拿锁前先取到“下一次尝试”的槽；若等锁期间这次尝试失败了，就拿到这一次的错误，
/// 不会被之后别人发起的尝试的结果替代。失败后仍是 Unloaded，新的调用可以重试。
#[derive(Default)]
pub struct LazyPartition {
    partition: ArcSwapOption<Partition>,
    attempt: ArcSwap<LoadAttempt>,
    load_lock: Mutex<()>,
}

impl LazyPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已加载的分区直接包装为 Loaded
    pub fn loaded(partition: Arc<Partition>) -> Self {
        Self {
            partition: ArcSwapOption::from(Some(partition)),
            ..Self::default()
        }
    }

    pub fn get_partition(
        &self,
        namespace: &str,
        table: &Arc<Table>,
        partition_id: &PartitionId,
        config: &Arc<ServerConfig>,
        resolver: &dyn PartitionResolver,
    ) -> Result<Arc<Partition>> {
        if let Some(p) = self.partition.load_full() {
            return Ok(p);
        }
        // 必须在拿锁之前取：它就是本调用等待的那次尝试
        let attempt = self.attempt.load_full();
        self.load_slow(attempt, namespace, table, partition_id, config, resolver)
    }

    fn load_slow(
        &self,
        attempt: Arc<LoadAttempt>,
        namespace: &str,
        table: &Arc<Table>,
        partition_id: &PartitionId,
        config: &Arc<ServerConfig>,
        resolver: &dyn PartitionResolver,
    ) -> Result<Arc<Partition>> {
        let _g = self.load_lock.lock();

        if let Some(p) = self.partition.load_full() {
            return Ok(p);
        }
        if let Some(err) = attempt.error.get() {
            tracing::debug!(
                "Lazy load of {}/{}/{} failed while waiting: {}",
                namespace,
                table.name,
                partition_id,
                err
            );
            return Err(err.clone());
        }

        match resolver.resolve(namespace, table, partition_id, config) {
            Ok(p) => {
                tracing::debug!("Lazy partition loaded: {}", p.key());
                self.partition.store(Some(p.clone()));
                Ok(p)
            }
            Err(e) => {
                // 等待者持有的是 self.attempt 的当前槽；这里只在锁内写入并换新
                let current = self.attempt.load_full();
                let _ = current.error.set(e.clone());
                self.attempt.store(Arc::new(LoadAttempt::default()));
                Err(e)
            }
        }
    }

    /// 只返回已缓存的分区，从不触发加载
    pub fn partition(&self) -> Option<Arc<Partition>> {
        self.partition.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.partition.load().is_some()
    }
}
