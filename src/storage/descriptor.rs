use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::core::{KeyRange, MetadataTransaction, PartitionId, PartitionKey, ReplicationTarget};
use crate::error::{PartitionError, Result};

/// descriptor 文件 Header
const MAGIC: u32 = 0x5044_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8; // magic + version + state + data_len + checksum

pub const DESCRIPTOR_FILE: &str = "descriptor";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// 落盘格式标记：是否按 LSMv2 布局对待
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    #[default]
    Legacy,
    LsmV2,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub record_count: u64,
}

/// 重建 `PartitionSnapshot` 所需的全部持久化状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub key: PartitionKey,
    pub version: u64,
    pub segments: Vec<SegmentDescriptor>,
    pub metadata_txn: MetadataTransaction,
    pub keyrange: KeyRange,
    pub replication_targets: Vec<ReplicationTarget>,
    pub is_splitting: bool,
    pub split_partition_ids: Vec<PartitionId>,
    pub format: StorageFormat,
    pub created_at_ms: u64,
}

/// 原子 descriptor 存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 descriptor.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，边写边计算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 任一步骤前崩溃，target 保持旧 descriptor；加载时 magic/version/state/len/checksum 任何不一致都是损坏。
pub struct DescriptorStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u32, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..16].copy_from_slice(&data_len.to_le_bytes());
    header[16..24].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl DescriptorStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DESCRIPTOR_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 读取 descriptor；不存在返回 `Ok(None)`，校验失败返回 `CorruptState`
    pub fn load(&self) -> Result<Option<SnapshotDescriptor>> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PartitionError::io("read descriptor", e)),
        };
        Self::decode(&self.path, &data).map(Some)
    }

    pub fn decode(path: &Path, data: &[u8]) -> Result<SnapshotDescriptor> {
        let corrupt = |reason: String| {
            tracing::warn!("Descriptor {} rejected: {}", path.display(), reason);
            PartitionError::corrupt(path, reason)
        };

        if data.len() < HEADER_SIZE {
            return Err(corrupt(format!("descriptor too small ({} bytes)", data.len())));
        }

        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let magic = word(0);
        let version = word(4);
        let state = word(8);
        let data_len = word(12) as usize;
        let mut ck = [0u8; 8];
        ck.copy_from_slice(&data[16..24]);
        let stored_checksum = u64::from_le_bytes(ck);

        if magic != MAGIC {
            return Err(corrupt(format!("magic mismatch: {:#x} != {:#x}", magic, MAGIC)));
        }
        if version != VERSION_CURRENT {
            return Err(corrupt(format!(
                "version mismatch: {} != {}",
                version, VERSION_CURRENT
            )));
        }
        if state != STATE_COMMITTED {
            return Err(corrupt("state INCOMPLETE".to_string()));
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            return Err(corrupt(format!(
                "data length mismatch: {} != {}",
                body.len(),
                data_len
            )));
        }

        let mut h = Xxh3::new();
        h.update(body);
        let computed = h.digest();
        if computed != stored_checksum {
            return Err(corrupt(format!(
                "checksum mismatch: {:#x} != {:#x}",
                computed, stored_checksum
            )));
        }

        bincode::deserialize::<SnapshotDescriptor>(body)
            .map_err(|e| corrupt(format!("deserialize failed: {}", e)))
    }

    /// 原子写入 descriptor（覆盖旧版本）
    pub fn write_atomic(&self, desc: &SnapshotDescriptor) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let res = self.write_tmp(&tmp_path, desc).and_then(|data_len| {
            // 5) rename 原子替换
            std::fs::rename(&tmp_path, &self.path)
                .map_err(|e| PartitionError::io("rename descriptor", e))?;
            Ok(data_len)
        });
        let data_len = match res {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        self.sync_dir();

        tracing::debug!(
            "Descriptor written: {} v{} ({} segments, {} bytes)",
            desc.key,
            desc.version,
            desc.segments.len(),
            HEADER_SIZE + data_len as usize
        );
        Ok(())
    }

    /// 仅当 descriptor 尚不存在时写入；已存在返回 `Ok(false)`。
    ///
    /// 用 hard link 发布，目标已存在时 link 失败，因此并发 create 只有一个会成功。
    pub fn create_new(&self, desc: &SnapshotDescriptor) -> Result<bool> {
        if self.exists() {
            return Ok(false);
        }
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .path
            .with_extension(format!("{}-{}.tmp", std::process::id(), seq));

        let res = self.write_tmp(&tmp_path, desc).and_then(|_| {
            match std::fs::hard_link(&tmp_path, &self.path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(PartitionError::io("link descriptor", e)),
            }
        });
        let _ = std::fs::remove_file(&tmp_path);
        if let Ok(true) = res {
            self.sync_dir();
        }
        res
    }

    fn write_tmp(&self, tmp_path: &Path, desc: &SnapshotDescriptor) -> Result<u32> {
        let io = |op: &'static str| move |e: std::io::Error| PartitionError::io(op, e);

        let file = std::fs::File::create(tmp_path).map_err(io("create descriptor"))?;
        let mut w = BufWriter::new(file);

        // 1) INCOMPLETE header
        w.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))
            .map_err(io("write descriptor"))?;

        // 2) 流式写 body
        let (data_len_u64, checksum) = {
            let mut cw = ChecksumWriter::new(&mut w);
            bincode::serialize_into(&mut cw, desc)
                .map_err(|e| PartitionError::io("serialize descriptor", e))?;
            cw.finish()
        };
        let data_len: u32 = data_len_u64.try_into().map_err(|_| PartitionError::Io {
            operation: "serialize descriptor",
            message: format!("descriptor too large (>{} bytes)", u32::MAX),
        })?;

        let mut file = w
            .into_inner()
            .map_err(|e| PartitionError::io("flush descriptor", e.error()))?;

        // 3) seek 回开头覆盖 COMMITTED header
        file.seek(SeekFrom::Start(0)).map_err(io("seek descriptor"))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))
            .map_err(io("write descriptor"))?;

        // 4) fsync
        file.sync_all().map_err(io("fsync descriptor"))?;
        Ok(data_len)
    }

    // 6) fsync(dir)
    fn sync_dir(&self) {
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotDescriptor {
        SnapshotDescriptor {
            key: PartitionKey::new("a", "events", PartitionId::compute(b"h")),
            version: 3,
            segments: vec![SegmentDescriptor {
                name: "seg-0000000000000001.dat".to_string(),
                size_bytes: 128,
                record_count: 4,
            }],
            metadata_txn: MetadataTransaction::new(PartitionId::compute(b"t"), 9),
            keyrange: KeyRange::new("a", "m"),
            replication_targets: vec![ReplicationTarget::leader("node-a")],
            is_splitting: false,
            split_partition_ids: Vec::new(),
            format: StorageFormat::Legacy,
            created_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn absent_descriptor_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::in_dir(dir.path());
        assert!(!store.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn write_atomic_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::in_dir(dir.path());
        let desc = sample();
        store.write_atomic(&desc).unwrap();
        assert!(!dir.path().join("descriptor.tmp").exists());
        assert_eq!(store.load().unwrap(), Some(desc.clone()));

        let mut newer = desc;
        newer.version = 4;
        store.write_atomic(&newer).unwrap();
        assert_eq!(store.load().unwrap().unwrap().version, 4);
    }

    #[test]
    fn create_new_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::in_dir(dir.path());
        let desc = sample();
        assert!(store.create_new(&desc).unwrap());

        let mut other = desc.clone();
        other.version = 42;
        assert!(!store.create_new(&other).unwrap());
        assert_eq!(store.load().unwrap(), Some(desc));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn damaged_descriptor_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::in_dir(dir.path());
        store.write_atomic(&sample()).unwrap();

        let mut bytes = std::fs::read(store.path()).unwrap();
        let mid = HEADER_SIZE + 5;
        bytes[mid] ^= 0x5a;
        std::fs::write(store.path(), &bytes).unwrap();
        assert!(matches!(store.load(), Err(PartitionError::CorruptState { .. })));

        std::fs::write(store.path(), b"garbage").unwrap();
        assert!(matches!(store.load(), Err(PartitionError::CorruptState { .. })));
    }

    #[test]
    fn incomplete_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::in_dir(dir.path());
        store.write_atomic(&sample()).unwrap();

        let mut bytes = std::fs::read(store.path()).unwrap();
        bytes[8..12].copy_from_slice(&STATE_INCOMPLETE.to_le_bytes());
        std::fs::write(store.path(), &bytes).unwrap();
        assert!(store.load().is_err());
    }
}
