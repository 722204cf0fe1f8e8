pub mod key;
pub mod metadata;
pub mod record;
pub mod table;

pub use key::{KeyRange, PartitionId, PartitionKey, RecordId};
pub use metadata::{DiscoveryCode, DiscoveryInfo, MetadataChange, MetadataTransaction, ReplicationTarget};
pub use record::Record;
pub use table::{PlacementPolicy, ReplicationConfig, Table, TableConfig};
