use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::xxh3_64;

use crate::core::{Record, RecordId};
use crate::error::{PartitionError, Result};

const SEG_MAGIC: u32 = 0x3147_4553; // "SEG1"
const SEG_VERSION: u32 = 1;
const SEG_HEADER_SIZE: usize = 8;
// len(u32) + checksum(u64)
const REC_PREFIX_SIZE: usize = 12;
const REC_FIXED_SIZE: usize = RecordId::LEN + 8;

/// 段文件名：seg-<version>.dat（version 为产生该段的快照版本）
pub fn segment_file_name(version: u64) -> String {
    format!("seg-{version:016x}.dat")
}

pub fn parse_segment_version(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("seg-")?.strip_suffix(".dat")?;
    u64::from_str_radix(hex, 16).ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentStats {
    pub size_bytes: u64,
    pub record_count: u64,
}

fn encode_record(rec: &Record, out: &mut Vec<u8>) {
    out.extend_from_slice(rec.id.as_bytes());
    out.extend_from_slice(&rec.version.to_le_bytes());
    out.extend_from_slice(&rec.payload);
}

fn decode_record(body: &[u8]) -> Option<Record> {
    if body.len() < REC_FIXED_SIZE {
        return None;
    }
    let id: [u8; 20] = body[..RecordId::LEN].try_into().ok()?;
    let version = u64::from_le_bytes(body[RecordId::LEN..REC_FIXED_SIZE].try_into().ok()?);
    Some(Record {
        id: RecordId::from_bytes(id),
        version,
        payload: body[REC_FIXED_SIZE..].to_vec(),
    })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    path.with_extension("dat.tmp")
}

/// 一次性写出一个段文件：tmp → fsync → rename。
///
/// 段文件一经发布不再修改；失败时清理 tmp，目标路径保持不存在。
pub fn write_segment(path: &Path, records: &[Record]) -> Result<SegmentStats> {
    let tmp = tmp_path_for(path);
    match write_segment_inner(&tmp, path, records) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_segment_inner(tmp: &Path, path: &Path, records: &[Record]) -> Result<SegmentStats> {
    let file = File::create(tmp).map_err(|e| PartitionError::io("create segment", e))?;
    let mut w = BufWriter::new(file);
    let mut size = SEG_HEADER_SIZE as u64;

    let mut header = [0u8; SEG_HEADER_SIZE];
    header[0..4].copy_from_slice(&SEG_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&SEG_VERSION.to_le_bytes());
    w.write_all(&header)
        .map_err(|e| PartitionError::io("write segment", e))?;

    let mut body = Vec::new();
    for rec in records {
        let encoded = rec.encoded_len();
        let len: u32 = encoded.try_into().map_err(|_| PartitionError::Io {
            operation: "write segment",
            message: format!("record {} too large ({} bytes)", rec.id, encoded),
        })?;
        body.clear();
        body.reserve(encoded);
        encode_record(rec, &mut body);
        let crc = xxh3_64(&body);
        w.write_all(&len.to_le_bytes())
            .and_then(|_| w.write_all(&crc.to_le_bytes()))
            .and_then(|_| w.write_all(&body))
            .map_err(|e| PartitionError::io("write segment", e))?;
        size += (REC_PREFIX_SIZE + body.len()) as u64;
    }

    let file = w
        .into_inner()
        .map_err(|e| PartitionError::io("flush segment", e.error()))?;
    file.sync_all()
        .map_err(|e| PartitionError::io("fsync segment", e))?;
    drop(file);
    std::fs::rename(tmp, path).map_err(|e| PartitionError::io("rename segment", e))?;

    Ok(SegmentStats {
        size_bytes: size,
        record_count: records.len() as u64,
    })
}

/// 读取并逐条校验；任何截断或校验失败都视为损坏
pub fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PartitionError::corrupt(path, "segment file missing")
        } else {
            PartitionError::io("read segment", e)
        }
    })?;
    decode_segment(path, &data)
}

pub fn decode_segment(path: &Path, data: &[u8]) -> Result<Vec<Record>> {
    if data.len() < SEG_HEADER_SIZE {
        return Err(PartitionError::corrupt(path, "segment shorter than header"));
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if magic != SEG_MAGIC {
        return Err(PartitionError::corrupt(
            path,
            format!("segment magic mismatch: {:#x} != {:#x}", magic, SEG_MAGIC),
        ));
    }
    if version != SEG_VERSION {
        return Err(PartitionError::corrupt(
            path,
            format!("unsupported segment version {}", version),
        ));
    }

    let mut out = Vec::new();
    let mut pos = SEG_HEADER_SIZE;
    while pos < data.len() {
        if data.len() - pos < REC_PREFIX_SIZE {
            return Err(PartitionError::corrupt(path, format!("truncated record header at {}", pos)));
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap_or([0; 4])) as usize;
        let crc = u64::from_le_bytes(data[pos + 4..pos + 12].try_into().unwrap_or([0; 8]));
        pos += REC_PREFIX_SIZE;
        if data.len() - pos < len {
            return Err(PartitionError::corrupt(path, format!("truncated record body at {}", pos)));
        }
        let body = &data[pos..pos + len];
        if xxh3_64(body) != crc {
            return Err(PartitionError::corrupt(path, format!("record checksum mismatch at {}", pos)));
        }
        let rec = decode_record(body)
            .ok_or_else(|| PartitionError::corrupt(path, format!("short record at {}", pos)))?;
        out.push(rec);
        pos += len;
    }
    Ok(out)
}

/// 复制落地：把对端传来的原始段字节原子安装到目标路径
pub fn install_segment_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    decode_segment(path, bytes)?;
    let tmp = tmp_path_for(path);
    let res = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = res {
        let _ = std::fs::remove_file(&tmp);
        return Err(PartitionError::io("install segment", e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(n: u8, version: u64) -> Record {
        Record::new(RecordId::from_bytes([n; 20]), version, vec![n; n as usize])
    }

    #[test]
    fn write_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let records = vec![rec(3, 1), rec(1, 7), rec(2, 0)];

        let stats = write_segment(&path, &records).unwrap();
        assert_eq!(stats.record_count, 3);
        assert_eq!(stats.size_bytes, std::fs::metadata(&path).unwrap().len());
        assert!(!tmp_path_for(&path).exists());

        assert_eq!(read_segment(&path).unwrap(), records);
    }

    #[test]
    fn stats_match_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(5));
        let records = vec![rec(4, 0), rec(9, 2), rec(0, 1)];
        let stats = write_segment(&path, &records).unwrap();

        let framed: usize = records.iter().map(|r| REC_PREFIX_SIZE + r.encoded_len()).sum();
        assert_eq!(stats.size_bytes, (SEG_HEADER_SIZE + framed) as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), stats.size_bytes);
        assert_eq!(stats.record_count, 3);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(2));
        write_segment(&path, &[rec(5, 1)]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(read_segment(&path), Err(PartitionError::CorruptState { .. })));
    }

    #[test]
    fn truncated_tail_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(3));
        write_segment(&path, &[rec(4, 1), rec(6, 1)]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(read_segment(&path).is_err());
    }

    #[test]
    fn missing_directory_fails_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join(segment_file_name(4));
        assert!(write_segment(&path, &[rec(1, 1)]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn file_names_roundtrip() {
        assert_eq!(segment_file_name(26), "seg-000000000000001a.dat");
        assert_eq!(parse_segment_version("seg-000000000000001a.dat"), Some(26));
        assert_eq!(parse_segment_version("descriptor"), None);
    }
}
