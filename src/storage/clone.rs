use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::core::error::{MrfError, Result};
use crate::index::entry::{decode_block, encode_block, TileIdx, CHECKED};
use crate::storage::files::IndexFile;

/// 远端索引按块导入，块大小为 16 字节记录的整数倍
pub const CLONE_BLOCK: u64 = 32 * 1024;

/// 克隆缓存计数器
#[derive(Debug, Default)]
pub struct CloneStats {
    block_fetches: AtomicU64,
    tiles_fetched: AtomicU64,
    remote_absent: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CloneCounters {
    pub block_fetches: u64,
    pub tiles_fetched: u64,
    pub remote_absent: u64,
}

impl CloneStats {
    pub fn record_tile(&self) {
        self.tiles_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_absent(&self) {
        self.remote_absent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CloneCounters {
        CloneCounters {
            block_fetches: self.block_fetches.load(Ordering::Relaxed),
            tiles_fetched: self.tiles_fetched.load(Ordering::Relaxed),
            remote_absent: self.remote_absent.load(Ordering::Relaxed),
        }
    }
}

/// 解析 bias 区中的索引项，必要时从远端索引导入所在的块
///
/// 本地索引在 `bias + idx_offset` 处记录远端索引的镜像。(0, 0) 表示该块尚未导入：
/// 从远端读取整块，把其中的 (0, 0) 标记为已检查，写回本地后再读一次。
/// 每次解析最多触发一次远端读取。`bias == 0` 时只读本地项。
pub fn resolve_entry<F>(
    local: &IndexFile,
    idx_offset: u64,
    bias: u64,
    stats: &CloneStats,
    remote: F,
) -> Result<TileIdx>
where
    F: FnOnce() -> Result<std::sync::Arc<IndexFile>>,
{
    let pos = bias + idx_offset;
    let entry = local.read_entry(pos)?;
    if bias == 0 || !entry.is_empty() {
        return Ok(entry);
    }
    if idx_offset >= bias {
        return Err(MrfError::config(format!(
            "index offset {} is outside the cloned region of {} bytes",
            idx_offset, bias
        )));
    }

    let remote = remote()?;
    fetch_block(local, &remote, idx_offset, bias, stats)?;
    local.read_entry(pos)
}

/// 导入包含 `idx_offset` 的远端索引块，返回被标记为已检查的记录数
pub fn fetch_block(
    local: &IndexFile,
    remote: &IndexFile,
    idx_offset: u64,
    bias: u64,
    stats: &CloneStats,
) -> Result<usize> {
    let block = idx_offset / CLONE_BLOCK * CLONE_BLOCK;
    let len = CLONE_BLOCK.min(bias - block);

    let bytes = remote.read_bytes(block, len).map_err(|e| {
        tracing::error!(
            "Can't read cloned source index {}: {}",
            remote.path().display(),
            e
        );
        e
    })?;

    let mut entries = decode_block(&bytes);
    let mut marked = 0;
    for e in entries.iter_mut().filter(|e| e.is_empty()) {
        *e = TileIdx::new(CHECKED, 0);
        marked += 1;
    }

    local.write_bytes(bias + block, &encode_block(&entries))?;
    stats.block_fetches.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        "Cloned index block {}..{} from {} ({} of {} records empty)",
        block,
        block + len,
        remote.path().display(),
        marked,
        entries.len()
    );
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::files::{FileMode, WaitPolicy};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mrf-clone-{}-{}", tag, nanos))
    }

    fn rw() -> FileMode {
        FileMode {
            update: true,
            creating: true,
            ..Default::default()
        }
    }

    #[test]
    fn resolves_block_and_marks_empty_records() {
        let dir = unique_tmp_dir("block");
        std::fs::create_dir_all(&dir).unwrap();
        // 两个块多一点：第二块只有 16 条记录
        let bias = CLONE_BLOCK + 256;
        let remote = Arc::new(IndexFile::new(dir.join("r.idx"), rw(), WaitPolicy::default(), bias));
        remote.write_entry(CLONE_BLOCK + 32, TileIdx::new(900, 12)).unwrap();
        remote.write_entry(CLONE_BLOCK + 64, TileIdx::new(1, 0)).unwrap();
        remote.write_entry(16, TileIdx::new(5, 5)).unwrap();

        let local = IndexFile::new(dir.join("l.idx"), rw(), WaitPolicy::default(), 2 * bias);
        let stats = CloneStats::default();

        let e = resolve_entry(&local, CLONE_BLOCK + 32, bias, &stats, || Ok(remote.clone()))
            .unwrap();
        assert_eq!(e, TileIdx::new(900, 12));
        assert_eq!(stats.snapshot().block_fetches, 1);

        // 同一块内的空记录已标记
        let other = local.read_entry(bias + CLONE_BLOCK + 48).unwrap();
        assert_eq!(other, TileIdx::new(CHECKED, 0));
        assert_eq!(
            local.read_entry(bias + CLONE_BLOCK + 64).unwrap(),
            TileIdx::new(1, 0)
        );
        // 块长度被截断在 bias 处，第一块未导入
        assert!(local.read_entry(bias + 16).unwrap().is_empty());
        assert!(local.read_entry(bias).unwrap().is_empty());

        // 再次解析不触发远端读取
        let again = resolve_entry(&local, CLONE_BLOCK + 48, bias, &stats, || {
            panic!("remote must not be opened again")
        })
        .unwrap();
        assert!(again.is_marked_empty());
        assert_eq!(stats.snapshot().block_fetches, 1);
    }

    #[test]
    fn zero_bias_reads_local_only() {
        let dir = unique_tmp_dir("nobias");
        std::fs::create_dir_all(&dir).unwrap();
        let local = IndexFile::new(dir.join("l.idx"), rw(), WaitPolicy::default(), 64);
        let stats = CloneStats::default();
        let e = resolve_entry(&local, 16, 0, &stats, || panic!("no remote")).unwrap();
        assert!(e.is_empty());
    }

    #[test]
    fn unreadable_remote_is_fatal() {
        let dir = unique_tmp_dir("remote-err");
        std::fs::create_dir_all(&dir).unwrap();
        let local = IndexFile::new(dir.join("l.idx"), rw(), WaitPolicy::default(), 128);
        // 远端索引比块短
        let remote = Arc::new(IndexFile::new(dir.join("r.idx"), rw(), WaitPolicy::default(), 16));
        let stats = CloneStats::default();
        let res = resolve_entry(&local, 0, 64, &stats, || Ok(remote.clone()));
        assert!(matches!(res, Err(MrfError::Io { .. })));
        assert_eq!(stats.snapshot().block_fetches, 0);
    }
}
