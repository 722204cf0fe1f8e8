#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod error;
pub mod partition;
pub mod registry;
pub mod replication;
pub mod stats;
pub mod storage;

pub use config::ServerConfig;
pub use error::{PartitionError, Result};
pub use partition::{LazyPartition, Partition, PartitionInfo, PartitionReader, PartitionSnapshot, PartitionWriter};
pub use registry::PartitionMap;
pub use replication::{ConnectionPool, LocalConnectionPool, PartitionReplication, StrategyKind};
