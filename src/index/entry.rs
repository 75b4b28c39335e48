use std::fs::File;
use std::num::NonZeroU64;
use std::os::unix::fs::FileExt;
use std::path::Path;

use serde::Serialize;

use crate::core::error::{MrfError, Result};

/// 单条索引记录字节数：offset(8) + size(8)，网络字节序
pub const IDX_RECORD: u64 = 16;

/// 缓存用“已检查、确认为空”标记（任何非零 offset 均可，用 1 只占一位）
pub const CHECKED_MARKER: NonZeroU64 = NonZeroU64::MIN;
pub const CHECKED: u64 = CHECKED_MARKER.get();

/// 瓦片定位记录
///
/// - `(0, 0)`：从未写入
/// - `size == 0 && offset != 0`：存在但为空（offset 是哨兵值，不是文件位置）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TileIdx {
    pub offset: u64,
    pub size: u64,
}

impl TileIdx {
    pub const EMPTY: TileIdx = TileIdx { offset: 0, size: 0 };

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// 从未写入
    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    pub fn is_present(&self) -> bool {
        self.size > 0
    }

    /// 已确认为空（带哨兵）
    pub fn is_marked_empty(&self) -> bool {
        self.size == 0 && self.offset != 0
    }

    pub fn to_bytes(self) -> [u8; IDX_RECORD as usize] {
        let mut out = [0u8; IDX_RECORD as usize];
        out[0..8].copy_from_slice(&self.offset.to_be_bytes());
        out[8..16].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; IDX_RECORD as usize]) -> Self {
        let mut off = [0u8; 8];
        let mut sz = [0u8; 8];
        off.copy_from_slice(&b[0..8]);
        sz.copy_from_slice(&b[8..16]);
        Self {
            offset: u64::from_be_bytes(off),
            size: u64::from_be_bytes(sz),
        }
    }
}

/// 解码一段连续记录；尾部不足 16 字节的部分忽略
pub fn decode_block(bytes: &[u8]) -> Vec<TileIdx> {
    bytes
        .chunks_exact(IDX_RECORD as usize)
        .map(|c| {
            let mut rec = [0u8; IDX_RECORD as usize];
            rec.copy_from_slice(c);
            TileIdx::from_bytes(&rec)
        })
        .collect()
}

pub fn encode_block(entries: &[TileIdx]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * IDX_RECORD as usize);
    for e in entries {
        out.extend_from_slice(&e.to_bytes());
    }
    out
}

/// 读取索引记录；超出文件末尾的位置视为从未写入（稀疏文件语义）
pub fn read_entry(file: &File, path: &Path, offset: u64) -> Result<TileIdx> {
    let mut rec = [0u8; IDX_RECORD as usize];
    match file.read_exact_at(&mut rec, offset) {
        Ok(()) => Ok(TileIdx::from_bytes(&rec)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(TileIdx::EMPTY),
        Err(e) => Err(MrfError::io(path, e)),
    }
}

pub fn write_entry(file: &File, path: &Path, offset: u64, entry: TileIdx) -> Result<()> {
    file.write_all_at(&entry.to_bytes(), offset)
        .map_err(|e| MrfError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_big_endian_regardless_of_host() {
        let e = TileIdx::new(0x0102, 0x0A0B0C);
        let b = e.to_bytes();
        assert_eq!(&b[0..8], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&b[8..16], &[0, 0, 0, 0, 0, 0x0A, 0x0B, 0x0C]);
        assert_eq!(TileIdx::from_bytes(&b), e);
    }

    #[test]
    fn empty_and_marked_are_distinct() {
        assert!(TileIdx::EMPTY.is_empty());
        let marked = TileIdx::new(CHECKED, 0);
        assert!(!marked.is_empty());
        assert!(marked.is_marked_empty());
        assert!(!marked.is_present());
    }

    #[test]
    fn decode_block_ignores_partial_tail() {
        let mut bytes = encode_block(&[TileIdx::new(16, 4), TileIdx::new(1, 0)]);
        bytes.extend_from_slice(&[0xFF; 5]);
        let v = decode_block(&bytes);
        assert_eq!(v, vec![TileIdx::new(16, 4), TileIdx::new(1, 0)]);
    }
}
