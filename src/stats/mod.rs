use std::fmt;

use serde::Serialize;

use crate::storage::clone::CloneCounters;

/// 数据集概况：金字塔、索引/数据文件大小、版本与克隆计数
#[derive(Clone, Debug, Default, Serialize)]
pub struct DatasetReport {
    pub descriptor: String,
    pub compression: String,
    pub levels: Vec<LevelReport>,
    /// 单个版本的索引长度
    pub idx_size: u64,
    pub version_count: u64,
    pub index_file_bytes: u64,
    pub data_file_bytes: u64,
    pub cloned: bool,
    pub clone: CloneCounters,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LevelReport {
    pub level: usize,
    pub width: u64,
    pub height: u64,
    pub pages_x: u64,
    pub pages_y: u64,
    /// 含所有 z 切片与波段组
    pub pages: u64,
    pub idx_offset: u64,
    /// 当前版本中有数据的页
    pub present: u64,
}

impl DatasetReport {
    pub fn total_pages(&self) -> u64 {
        self.levels.iter().map(|l| l.pages).sum()
    }

    pub fn present_pages(&self) -> u64 {
        self.levels.iter().map(|l| l.present).sum()
    }
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

impl fmt::Display for DatasetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           MRF Dataset Report                     ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ {:<48} ║", self.descriptor)?;
        writeln!(
            f,
            "║ compression: {:<10} cloned: {:<5}                ║",
            self.compression, self.cloned
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ level    size            pages    present  offset║")?;
        for l in &self.levels {
            writeln!(
                f,
                "║ {:>5} {:>7}x{:<7} {:>8} {:>10} {:>6}║",
                l.level, l.width, l.height, l.pages, l.present, l.idx_offset
            )?;
        }
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   pages:        {:>10}  ({:>10} present)  ║",
            self.total_pages(),
            self.present_pages()
        )?;
        writeln!(
            f,
            "║   idx size:     {:>10}                       ║",
            human_bytes(self.idx_size)
        )?;
        writeln!(
            f,
            "║   versions:     {:>10}                       ║",
            self.version_count
        )?;
        writeln!(
            f,
            "║   index file:   {:>10}                       ║",
            human_bytes(self.index_file_bytes)
        )?;
        writeln!(
            f,
            "║   data file:    {:>10}                       ║",
            human_bytes(self.data_file_bytes)
        )?;
        if self.cloned || self.clone != CloneCounters::default() {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Cache:                                           ║")?;
            writeln!(
                f,
                "║   blocks:       {:>10}                       ║",
                self.clone.block_fetches
            )?;
            writeln!(
                f,
                "║   tiles:        {:>10}                       ║",
                self.clone.tiles_fetched
            )?;
            writeln!(
                f,
                "║   absent:       {:>10}                       ║",
                self.clone.remote_absent
            )?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
