//! 分区注册表：显式构造的 `PartitionMap`，把 (namespace, table, partition_id) 映射到延迟加载的分区。
//!
//! 注册表本身只持有 `Arc<LazyPartition>`，首次访问才从磁盘 `reopen`；`shutdown` 之后拒绝一切访问。

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::ServerConfig;
use crate::core::key::validate_dir_name;
use crate::core::{DiscoveryInfo, PartitionId, PartitionKey, Table, TableConfig};
use crate::error::{PartitionError, Result};
use crate::partition::{LazyPartition, Partition, PartitionResolver};
use crate::stats::RegistryReport;
use crate::storage::DescriptorStore;
use crate::storage::StorageFormat;

pub struct PartitionMap {
    config: Arc<ServerConfig>,
    tables: DashMap<(String, String), Arc<Table>>,
    partitions: DashMap<PartitionKey, Arc<LazyPartition>>,
    shut_down: AtomicBool,
}

impl PartitionMap {
    /// 只登记配置里的表，不触碰磁盘
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let map = Self {
            tables: DashMap::new(),
            partitions: DashMap::new(),
            shut_down: AtomicBool::new(false),
            config,
        };
        for def in &map.config.tables {
            map.configure_table(def.to_table());
        }
        map
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// 扫描 `<data_dir>/<ns>/<table>/<hex>/descriptor`，为已知表的分区登记未加载的 lazy 项。
    ///
    /// 未配置的表默认跳过；`adopt_unknown_tables` 打开时以默认表配置登记。
    /// 返回新登记的数量；数据目录不存在时为 0。
    pub fn open(&self) -> Result<usize> {
        self.ensure_running()?;
        let root = &self.config.data_dir;
        if !root.is_dir() {
            tracing::info!("Data dir {} does not exist yet, nothing to open", root.display());
            return Ok(0);
        }

        let mut registered = 0usize;
        for ns in subdirs(root)? {
            for table_name in subdirs(&root.join(&ns))? {
                if !self.tables.contains_key(&(ns.clone(), table_name.clone())) && !self.adopt_table(&ns, &table_name) {
                    continue;
                }
                for hex in subdirs(&root.join(&ns).join(&table_name))? {
                    let Ok(id) = PartitionId::from_hex(&hex) else {
                        tracing::debug!("Skipping non-partition dir {}/{}/{}", ns, table_name, hex);
                        continue;
                    };
                    let key = PartitionKey::new(ns.as_str(), table_name.as_str(), id);
                    if !DescriptorStore::in_dir(&self.config.data_dir.join(key.relative_path())).exists() {
                        continue;
                    }
                    if !self.partitions.contains_key(&key) {
                        self.partitions.insert(key, Arc::new(LazyPartition::new()));
                        registered += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Partition map opened at {}: {} partitions registered ({} tables)",
            root.display(),
            registered,
            self.tables.len()
        );
        Ok(registered)
    }

    fn adopt_table(&self, namespace: &str, table: &str) -> bool {
        if !self.config.adopt_unknown_tables {
            tracing::debug!("Skipping partitions of unconfigured table {}/{}", namespace, table);
            return false;
        }
        if let Err(e) = validate_dir_name("namespace", namespace).and_then(|_| validate_dir_name("table", table)) {
            tracing::warn!("Not adopting on-disk table {}/{}: {}", namespace, table, e);
            return false;
        }
        tracing::info!("Adopting unconfigured table {}/{} with default config", namespace, table);
        self.configure_table(Table::new(namespace, table, TableConfig::default()));
        true
    }

    /// 登记或替换表配置；已加载分区继续持有旧的 `Arc<Table>`
    pub fn configure_table(&self, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.tables
            .insert((table.namespace.clone(), table.name.clone()), table.clone());
        tracing::debug!(
            "Configured table {}/{} (factor {}, {:?})",
            table.namespace,
            table.name,
            table.replication_factor(),
            table.placement()
        );
        table
    }

    pub fn find_table(&self, namespace: &str, table: &str) -> Result<Arc<Table>> {
        self.tables
            .get(&(namespace.to_string(), table.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| PartitionError::UnknownTable {
                namespace: namespace.to_string(),
                table: table.to_string(),
            })
    }

    /// 取已有分区，磁盘上没有则按 discovery 新建
    pub fn find_or_create(
        &self,
        namespace: &str,
        table: &str,
        partition_id: PartitionId,
        discovery: &DiscoveryInfo,
    ) -> Result<Arc<Partition>> {
        self.ensure_running()?;
        let table = self.find_table(namespace, table)?;
        let key = PartitionKey::checked(namespace, &table.name, partition_id)?;
        let lazy = self.partitions.entry(key).or_default().clone();
        lazy.get_partition(
            namespace,
            &table,
            &partition_id,
            &self.config,
            &CreateOrReopen { discovery },
        )
    }

    /// 查找分区并按需加载；磁盘上不存在时返回 `None`
    pub fn find_partition(
        &self,
        namespace: &str,
        table: &str,
        partition_id: PartitionId,
    ) -> Result<Option<Arc<Partition>>> {
        self.ensure_running()?;
        let table = self.find_table(namespace, table)?;
        let key = PartitionKey::checked(namespace, &table.name, partition_id)?;

        let lazy = match self.partitions.get(&key).map(|e| e.value().clone()) {
            Some(lazy) => lazy,
            None => {
                let dir = self.config.data_dir.join(key.relative_path());
                if !DescriptorStore::in_dir(&dir).exists() {
                    return Ok(None);
                }
                self.partitions.entry(key).or_default().clone()
            }
        };

        match lazy.get_partition(namespace, &table, &partition_id, &self.config, self) {
            Ok(p) => Ok(Some(p)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 全部已登记分区（含未加载），按 key 排序
    pub fn list_partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// 已加载的分区；不触发加载
    pub fn loaded_partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .iter()
            .filter_map(|e| e.value().partition())
            .collect()
    }

    pub fn report(&self) -> RegistryReport {
        let mut report = RegistryReport {
            partitions_known: self.partitions.len(),
            tables: self.tables.len(),
            ..RegistryReport::default()
        };
        for p in self.loaded_partitions() {
            let snap = p.snapshot();
            report.partitions_loaded += 1;
            report.total_records += snap.record_count();
            report.total_bytes += snap.total_size();
            if snap.is_splitting() {
                report.splitting += 1;
            }
            if snap.format() == StorageFormat::LsmV2 {
                report.lsm_v2 += 1;
            }
        }
        report
    }

    /// 丢弃全部缓存分区；之后的访问返回 `ShutDown`。返回被丢弃的项数
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let dropped = self.partitions.len();
        self.partitions.clear();
        tracing::info!("Partition map shut down, released {} partitions", dropped);
        dropped
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(PartitionError::ShutDown);
        }
        Ok(())
    }
}

impl PartitionResolver for PartitionMap {
    fn resolve(
        &self,
        namespace: &str,
        table: &Arc<Table>,
        partition_id: &PartitionId,
        config: &Arc<ServerConfig>,
    ) -> Result<Arc<Partition>> {
        Partition::reopen(namespace, table.clone(), *partition_id, config.clone())
    }
}

/// find_or_create 的解析器：先 reopen，不存在再 create；create 撞上并发创建时回退到 reopen
struct CreateOrReopen<'a> {
    discovery: &'a DiscoveryInfo,
}

impl PartitionResolver for CreateOrReopen<'_> {
    fn resolve(
        &self,
        namespace: &str,
        table: &Arc<Table>,
        partition_id: &PartitionId,
        config: &Arc<ServerConfig>,
    ) -> Result<Arc<Partition>> {
        match Partition::reopen(namespace, table.clone(), *partition_id, config.clone()) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        match Partition::create(namespace, table.clone(), *partition_id, self.discovery, config.clone()) {
            Err(PartitionError::AlreadyExists { .. }) => {
                Partition::reopen(namespace, table.clone(), *partition_id, config.clone())
            }
            other => other,
        }
    }
}

fn subdirs(dir: &Path) -> Result<Vec<String>> {
    let rd = std::fs::read_dir(dir).map_err(|e| PartitionError::io("scan data dir", e))?;
    let mut out = Vec::new();
    for ent in rd.flatten() {
        if !ent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = ent.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    out.sort();
    Ok(out)
}
