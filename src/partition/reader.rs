use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Record, RecordId};
use crate::error::Result;
use crate::partition::snapshot::PartitionSnapshot;
use crate::storage::read_segment;

/// 绑定到单个快照的只读视图（不是 live view）
pub struct PartitionReader {
    snapshot: Arc<PartitionSnapshot>,
}

impl PartitionReader {
    pub fn new(snapshot: Arc<PartitionSnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &Arc<PartitionSnapshot> {
        &self.snapshot
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn record_count(&self) -> u64 {
        self.snapshot.record_count()
    }

    /// 全部记录（含旧版本），按提交顺序
    pub fn records(&self) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(self.snapshot.record_count() as usize);
        for seg in self.snapshot.segments() {
            out.extend(read_segment(seg.path())?);
        }
        Ok(out)
    }

    /// 每个 id 只保留最高版本；版本相同时后提交者胜出。结果按 id 排序
    pub fn latest(&self) -> Result<Vec<Record>> {
        Ok(latest_versions(self.records()?))
    }

    pub fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let mut best: Option<Record> = None;
        for seg in self.snapshot.segments() {
            for rec in read_segment(seg.path())? {
                if rec.id == *id && best.as_ref().map_or(true, |b| rec.version >= b.version) {
                    best = Some(rec);
                }
            }
        }
        Ok(best)
    }
}

pub(crate) fn latest_versions(records: Vec<Record>) -> Vec<Record> {
    let mut by_id: HashMap<RecordId, Record> = HashMap::with_capacity(records.len());
    for rec in records {
        match by_id.get(&rec.id) {
            Some(existing) if existing.version > rec.version => {}
            _ => {
                by_id.insert(rec.id, rec);
            }
        }
    }
    let mut out: Vec<Record> = by_id.into_values().collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}
