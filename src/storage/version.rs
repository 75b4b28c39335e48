use crate::core::error::{MrfError, Result};
use crate::storage::files::IndexFile;

const COPY_CHUNK: u64 = 64 * 1024;

/// 版本日志：索引文件视为若干个完整索引快照，slot 0 为当前版本
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionLog {
    count: u64,
}

impl VersionLog {
    /// 由打开时的索引文件长度推导历史版本数：`len / idx_size - 1`
    pub fn from_index_len(len: u64, idx_size: u64) -> Self {
        if idx_size == 0 {
            return Self::default();
        }
        Self {
            count: (len / idx_size).saturating_sub(1),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 历史版本 `slot` 的索引偏移量
    pub fn slot_bias(&self, slot: u64, idx_size: u64) -> Result<u64> {
        if slot > self.count {
            return Err(MrfError::Version(format!(
                "version {} requested, only {} exist",
                slot, self.count
            )));
        }
        Ok(slot * idx_size)
    }

    /// 把当前索引（slot 0）整体复制到下一个空闲 slot，然后计数加一
    pub fn append_version(&mut self, index: &IndexFile, idx_size: u64) -> Result<u64> {
        let target = idx_size * (self.count + 1);
        let mut done = 0;
        while done < idx_size {
            let n = COPY_CHUNK.min(idx_size - done);
            let chunk = read_or_zero(index, done, n)?;
            index.write_bytes(target + done, &chunk)?;
            done += n;
        }
        self.count += 1;
        tracing::info!(
            "Appended index version {} to {} at offset {}",
            self.count,
            index.path().display(),
            target
        );
        Ok(self.count)
    }
}

// 稀疏索引的尾部可能还未落盘，按全零处理
fn read_or_zero(index: &IndexFile, offset: u64, len: u64) -> Result<Vec<u8>> {
    let avail = index.len().saturating_sub(offset).min(len);
    let mut buf = if avail > 0 {
        index.read_bytes(offset, avail)?
    } else {
        Vec::new()
    };
    buf.resize(len as usize, 0);
    Ok(buf)
}
