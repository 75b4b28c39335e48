use std::path::PathBuf;
use std::time::Duration;

use crate::core::geometry::TileCoord;

/// 存储引擎统一错误类型
///
/// - 配置错误：初始化阶段致命，不返回半成品对象
/// - I/O 错误：只对当前操作致命，已发布的索引项不受影响
/// - 超时：等待其它进程扩展文件超过上限
/// - mp-safe 回读校验失败本身不是错误（透明重试），只有重试耗尽才报告
#[derive(Debug, thiserror::Error)]
pub enum MrfError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for {} to reach {expected} bytes", path.display())]
    Timeout {
        path: PathBuf,
        expected: u64,
        waited: Duration,
    },

    #[error("tile write at index offset {idx_offset} did not verify after {attempts} attempts")]
    VerifyExhausted { idx_offset: u64, attempts: u32 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("tile {coord:?} is outside the level grid: {reason}")]
    InvalidTile { coord: TileCoord, reason: String },

    #[error("version error: {0}")]
    Version(String),

    #[error("dataset is not open for writing")]
    ReadOnly,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl MrfError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MrfError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MrfError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MrfError>;
