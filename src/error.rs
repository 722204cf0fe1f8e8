use std::path::PathBuf;

use crate::core::PartitionKey;

pub type Result<T> = std::result::Result<T, PartitionError>;

/// 分区核心的错误分类
///
/// 需要 `Clone`：同一次失败的 lazy load 要原样交给所有等待者。
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartitionError {
    #[error("partition already exists: {key}")]
    AlreadyExists { key: PartitionKey },

    #[error("partition not found: {key}")]
    NotFound { key: PartitionKey },

    #[error("invalid discovery info: {reason}")]
    InvalidDiscoveryInfo { reason: String },

    #[error("corrupt partition state at {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("writer unavailable for {key}: {reason}")]
    WriterUnavailable { key: PartitionKey, reason: String },

    #[error("replication transfer failed for peers {peers:?}: {reason}")]
    ReplicationTransfer { peers: Vec<String>, reason: String },

    #[error("commit failed for {key}: {reason}")]
    CommitFailed { key: PartitionKey, reason: String },

    #[error("unknown table {namespace}/{table}")]
    UnknownTable { namespace: String, table: String },

    #[error("invalid partition id: {input:?}")]
    InvalidPartitionId { input: String },

    #[error("invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("I/O error during {operation}: {message}")]
    Io {
        operation: &'static str,
        message: String,
    },

    #[error("partition map is shut down")]
    ShutDown,
}

impl PartitionError {
    pub(crate) fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        PartitionError::Io {
            operation,
            message: err.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PartitionError::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PartitionError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PartitionId;

    #[test]
    fn display_carries_key_and_reason() {
        let key = PartitionKey::new("a", "events", PartitionId::compute(b"x"));
        let err = PartitionError::AlreadyExists { key: key.clone() };
        assert!(err.to_string().contains("a/events/"));

        let err = PartitionError::corrupt("/tmp/p/descriptor", "checksum mismatch");
        let s = err.to_string();
        assert!(s.contains("/tmp/p/descriptor"));
        assert!(s.contains("checksum mismatch"));

        assert!(PartitionError::NotFound { key }.is_not_found());
    }
}
