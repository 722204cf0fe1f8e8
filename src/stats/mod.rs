use std::fmt;

use serde::Serialize;

/// 分区注册表概况（只统计已加载分区的数据量，未加载分区只计数）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryReport {
    /// 注册表里的分区数（含未加载）
    pub partitions_known: usize,
    pub partitions_loaded: usize,
    /// 已加载分区的记录总数（含旧版本）
    pub total_records: u64,
    /// 已加载分区的段文件总大小
    pub total_bytes: u64,
    pub splitting: usize,
    pub lsm_v2: usize,
    pub tables: usize,
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for RegistryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           tsdb-partition Status                  ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Tables:         {:>10}                       ║", self.tables)?;
        writeln!(f, "║ Partitions:     {:>10}                       ║", self.partitions_known)?;
        writeln!(f, "║   loaded:       {:>10}                       ║", self.partitions_loaded)?;
        writeln!(f, "║   splitting:    {:>10}                       ║", self.splitting)?;
        writeln!(f, "║   lsm v2:       {:>10}                       ║", self.lsm_v2)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Records:        {:>10}                       ║", self.total_records)?;
        writeln!(
            f,
            "║ On disk:        {:>10}                       ║",
            human_bytes(self.total_bytes)
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
