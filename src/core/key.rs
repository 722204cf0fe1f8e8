use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{PartitionError, Result};

/// 160-bit 内容哈希（SHA-1），分区与记录共用
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId([u8; 20]);

/// 记录 id 与分区 id 同构
pub type RecordId = PartitionId;

impl PartitionId {
    pub const LEN: usize = 20;

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let invalid = || PartitionError::InvalidPartitionId {
            input: s.to_string(),
        };
        let bytes = s.as_bytes();
        if bytes.len() != Self::LEN * 2 {
            return Err(invalid());
        }
        let mut out = [0u8; 20];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_val(pair[0]).ok_or_else(invalid)?;
            let lo = hex_val(pair[1]).ok_or_else(invalid)?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(Self::LEN * 2);
        for b in self.0 {
            s.push(HEX[(b >> 4) as usize] as char);
            s.push(HEX[(b & 0x0f) as usize] as char);
        }
        s
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.to_hex())
    }
}

impl Serialize for PartitionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PartitionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PartitionId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 分区寻址键：(namespace, table, partition_id)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub namespace: String,
    pub table: String,
    pub partition_id: PartitionId,
}

impl PartitionKey {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>, partition_id: PartitionId) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
            partition_id,
        }
    }

    /// 带名字校验的构造：namespace / table 会成为 data_dir 下的一级目录
    pub fn checked(namespace: impl Into<String>, table: impl Into<String>, partition_id: PartitionId) -> Result<Self> {
        let key = Self::new(namespace, table, partition_id);
        validate_dir_name("namespace", &key.namespace)?;
        validate_dir_name("table", &key.table)?;
        Ok(key)
    }

    /// 跨 namespace 唯一的 id：partition_id 只在单表内唯一
    pub fn uuid(&self) -> PartitionId {
        let mut h = Sha1::new();
        h.update(self.namespace.as_bytes());
        h.update([0u8]);
        h.update(self.table.as_bytes());
        h.update([0u8]);
        h.update(self.partition_id.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&h.finalize());
        PartitionId::from_bytes(out)
    }

    /// 相对 data_dir 的目录：<namespace>/<table>/<hex>
    pub fn relative_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.namespace)
            .join(&self.table)
            .join(self.partition_id.to_hex())
    }
}

/// 只接受单个普通路径分量：非空、非 `.`/`..`、不含分隔符、不是绝对路径
pub fn validate_dir_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason| PartitionError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("relative path component"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(invalid("contains a path separator"));
    }
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid("not a single directory name")),
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.table, self.partition_id)
    }
}

/// 分区负责的 key 区间 [begin, end)；end 为空表示无上界
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: String,
    pub end: String,
}

impl KeyRange {
    pub fn new(begin: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.end.is_empty() || self.begin < self.end
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.begin.as_str() && (self.end.is_empty() || key < self.end.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_and_rejects_garbage() {
        let id = PartitionId::compute(b"events-2016-01");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(PartitionId::from_hex(&hex).unwrap(), id);
        assert_eq!(PartitionId::from_hex(&hex.to_uppercase()).unwrap(), id);

        assert!(PartitionId::from_hex("abc").is_err());
        assert!(PartitionId::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            PartitionId::compute(b"abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn uuid_differs_across_namespaces() {
        let id = PartitionId::compute(b"p");
        let a = PartitionKey::new("a", "events", id);
        let b = PartitionKey::new("b", "events", id);
        assert_ne!(a.uuid(), b.uuid());
        assert_eq!(a.uuid(), a.clone().uuid());
        assert!(a.relative_path().ends_with(id.to_hex()));
    }

    #[test]
    fn checked_key_rejects_path_like_names() {
        let id = PartitionId::compute(b"p");
        assert!(PartitionKey::checked("metrics", "cpu.v2", id).is_ok());

        for bad in ["", ".", "..", "a/b", "a\\b", "/tmp/x", "nul\0"] {
            let err = PartitionKey::checked(bad, "cpu", id).unwrap_err();
            assert!(matches!(err, PartitionError::InvalidName { kind: "namespace", .. }), "{bad:?}");
            let err = PartitionKey::checked("metrics", bad, id).unwrap_err();
            assert!(matches!(err, PartitionError::InvalidName { kind: "table", .. }), "{bad:?}");
        }
    }

    #[test]
    fn keyrange_bounds() {
        let r = KeyRange::new("b", "d");
        assert!(r.is_valid());
        assert!(r.contains("b"));
        assert!(r.contains("c"));
        assert!(!r.contains("d"));
        assert!(!r.contains("a"));

        assert!(KeyRange::unbounded().contains("zzz"));
        assert!(!KeyRange::new("d", "b").is_valid());
    }
}
