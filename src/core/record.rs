use serde::{Deserialize, Serialize};

use crate::core::key::RecordId;

/// 单条记录：同一 id 的高版本覆盖低版本
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub version: u64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(id: RecordId, version: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            version,
            payload: payload.into(),
        }
    }

    /// 以 payload 内容寻址（id = sha1(payload)），版本为 0
    pub fn from_payload(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            id: RecordId::compute(&payload),
            version: 0,
            payload,
        }
    }

    /// 序列化后在段文件里占用的字节（不含 len/checksum 前缀）
    pub fn encoded_len(&self) -> usize {
        RecordId::LEN + 8 + self.payload.len()
    }
}
