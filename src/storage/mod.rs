pub mod descriptor;
pub mod segment;

pub use descriptor::{DescriptorStore, SegmentDescriptor, SnapshotDescriptor, StorageFormat};
pub use segment::{read_segment, segment_file_name, write_segment, SegmentStats};
