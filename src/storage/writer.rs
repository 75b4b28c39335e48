use std::num::NonZeroU64;

use crate::core::error::{MrfError, Result};
use crate::index::entry::TileIdx;
use crate::storage::files::{DataFile, IndexFile};
use crate::storage::version::VersionLog;

/// 待写入的瓦片内容
#[derive(Clone, Copy, Debug)]
pub enum TilePayload<'a> {
    /// 已编码的瓦片字节；空切片等同于擦除
    Data(&'a [u8]),
    /// 擦除：索引项置为 (0, 0)
    Erase,
    /// 空瓦片标记：size 为 0，offset 为非零哨兵
    Marker(NonZeroU64),
}

impl TilePayload<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            TilePayload::Data(b) => b,
            _ => &[],
        }
    }

    fn sentinel(&self) -> u64 {
        match self {
            TilePayload::Marker(n) => n.get(),
            _ => 0,
        }
    }
}

/// 瓦片数据的追加与回读
pub trait DataSink {
    /// 追加到末尾，返回写入位置
    fn append(&self, bytes: &[u8]) -> Result<u64>;
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>>;
}

impl DataSink for DataFile {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        DataFile::append(self, bytes)
    }

    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        DataFile::read_at(self, offset, len)
    }
}

/// 一次瓦片写入所需的文件与策略
pub struct WriteContext<'a> {
    pub index: &'a IndexFile,
    pub data: &'a dyn DataSink,
    /// 单个版本的索引长度
    pub idx_size: u64,
    /// 启用版本时为 Some
    pub versions: Option<&'a mut VersionLog>,
    pub mp_safe: bool,
    pub max_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 内容与已发布的一致，未触碰任何文件
    Unchanged,
    Written {
        entry: TileIdx,
        /// 写入前是否追加了一个版本快照
        versioned: bool,
        /// 追加次数（mp-safe 校验失败会重试）
        attempts: u32,
    },
}

/// 多进程安全的瓦片写入：追加数据、回读校验、发布索引项
///
/// 不加任何锁。数据文件以 append 方式打开，并发写者各自追加；
/// mp-safe 模式下回读刚写入的区间，不一致就重新追加，直到一致或达到上限。
/// 数据与索引的写入不是原子的：数据已追加而索引未写入是可接受的结果。
pub fn write_tile(
    ctx: &mut WriteContext<'_>,
    payload: TilePayload<'_>,
    idx_offset: u64,
) -> Result<WriteOutcome> {
    let bytes = payload.bytes();
    let size = bytes.len() as u64;
    let sentinel = payload.sentinel();

    let current = ctx.index.read_entry(idx_offset)?;
    let mut new_version = false;
    if let Some(log) = ctx.versions.as_deref() {
        new_version = if log.count() > 0 {
            let prev = ctx
                .index
                .read_entry(idx_offset + log.count() * ctx.idx_size)?;
            prev != current
        } else {
            true
        };
    }

    let new_tile = if current.size == size {
        if size != 0 {
            ctx.data.read_at(current.offset, size)? != bytes
        } else {
            // 空写在空项上：只有哨兵变化才算新瓦片
            current.offset != sentinel
        }
    } else {
        if ctx.versions.as_deref().is_some_and(|l| l.count() == 0) && current.size == 0 {
            new_version = false;
        }
        true
    };

    if !new_tile {
        tracing::debug!("Tile at index offset {} unchanged, skipping", idx_offset);
        return Ok(WriteOutcome::Unchanged);
    }

    let mut versioned = false;
    if new_version {
        if let Some(log) = ctx.versions.as_deref_mut() {
            log.append_version(ctx.index, ctx.idx_size)?;
            versioned = true;
        }
    }

    let mut entry = TileIdx::new(sentinel, 0);
    let mut attempts = 0;
    if size > 0 {
        entry = TileIdx::new(append_verified(ctx, bytes, idx_offset, &mut attempts)?, size);
    }

    ctx.index.write_entry(idx_offset, entry)?;
    Ok(WriteOutcome::Written {
        entry,
        versioned,
        attempts,
    })
}

fn append_verified(
    ctx: &WriteContext<'_>,
    bytes: &[u8],
    idx_offset: u64,
    attempts: &mut u32,
) -> Result<u64> {
    let max = ctx.max_attempts.max(1);
    while *attempts < max {
        *attempts += 1;
        let offset = ctx.data.append(bytes)?;
        if !ctx.mp_safe {
            return Ok(offset);
        }
        let back = ctx.data.read_at(offset, bytes.len() as u64)?;
        if back == bytes {
            return Ok(offset);
        }
        tracing::warn!(
            "Readback mismatch at data offset {} for index offset {} (attempt {}), retrying",
            offset,
            idx_offset,
            attempts
        );
    }
    tracing::error!(
        "Giving up on tile at index offset {} after {} attempts",
        idx_offset,
        max
    );
    Err(MrfError::VerifyExhausted {
        idx_offset,
        attempts: max,
    })
}
