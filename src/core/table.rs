use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// leader 主动推送给全部副本
    #[default]
    LeaderPush,
    /// 任一副本只给落后的对端补齐
    PeerPull,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_factor")]
    pub factor: u32,
    #[serde(default)]
    pub placement: PlacementPolicy,
}

fn default_replication_factor() -> u32 {
    3
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_replication_factor(),
            placement: PlacementPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default = "default_lsm_enabled")]
    pub lsm_enabled: bool,
}

fn default_lsm_enabled() -> bool {
    true
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            replication: ReplicationConfig::default(),
            lsm_enabled: default_lsm_enabled(),
        }
    }
}

/// 表：schema 存储在外部，这里只关心复制/布局配置；多个分区共享一个 `Arc<Table>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub config: TableConfig,
}

impl Table {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, config: TableConfig) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            config,
        }
    }

    pub fn replication_factor(&self) -> u32 {
        self.config.replication.factor
    }

    pub fn placement(&self) -> PlacementPolicy {
        self.config.replication.placement
    }
}
