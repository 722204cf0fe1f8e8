use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Table, TableConfig};

/// LSMv2 升级判定阈值（只做判定，不做迁移）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsmPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 段文件数达到该值即视为 LSMv2
    #[serde(default = "default_min_files")]
    pub min_files: usize,
    /// 或总大小达到该值
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_files() -> usize {
    8
}

fn default_min_size_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for LsmPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_files: default_min_files(),
            min_size_bytes: default_min_size_bytes(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// LeaderPush 扇出的最大并发
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_parallelism() -> usize {
    num_cpus::get()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub namespace: String,
    pub name: String,
    #[serde(flatten)]
    pub config: TableConfig,
}

impl TableDefinition {
    pub fn to_table(&self) -> Table {
        Table::new(&self.namespace, &self.name, self.config.clone())
    }
}

/// 进程级配置
///
/// 分区只持有 `Arc<ServerConfig>` 的克隆，从不修改；
/// 共享所有权保证配置活得比任何引用它的分区都久。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub lsm: LsmPolicy,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
    /// `PartitionMap::open` 遇到磁盘上未配置的表时，以默认表配置登记它
    #[serde(default)]
    pub adopt_unknown_tables: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tsdb-partition")
}

fn default_node_id() -> String {
    "local".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            node_id: default_node_id(),
            lsm: LsmPolicy::default(),
            replication: ReplicationSettings::default(),
            tables: Vec::new(),
            adopt_unknown_tables: false,
        }
    }
}

impl ServerConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        tracing::info!(
            "Loaded config {}: data_dir={} node_id={} tables={}",
            path.display(),
            cfg.data_dir.display(),
            cfg.node_id,
            cfg.tables.len()
        );
        Ok(cfg)
    }
}
