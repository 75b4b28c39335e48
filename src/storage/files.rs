use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::{MrfError, Result};
use crate::index::entry::{self, TileIdx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    Update,
}

/// 等待其它进程创建/扩展文件时的轮询策略（默认约 0.5s）
#[derive(Clone, Copy, Debug)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

impl WaitPolicy {
    pub fn total(&self) -> Duration {
        self.delay * self.attempts
    }
}

/// 文件打开模式，由数据集访问方式推导
#[derive(Clone, Copy, Debug, Default)]
pub struct FileMode {
    /// 以更新方式打开的数据集
    pub update: bool,
    /// 缓存数据集（有远端源），即使只读打开也需要写本地文件
    pub caching: bool,
    /// 正在创建数据集，文件不存在时创建
    pub creating: bool,
}

impl FileMode {
    pub fn writable(&self) -> bool {
        self.update || self.caching
    }
}

/// 逐级创建父目录；失败忽略（其它进程可能同时在创建）
pub fn create_parent_dirs(path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// 把文件稀疏扩展到至少 `size` 字节，从不截断
///
/// 与其它进程并发扩展时，按策略重试，超过上限返回超时。
pub fn extend_file(file: &File, path: &Path, size: u64, wait: &WaitPolicy) -> Result<()> {
    for attempt in 0..=wait.attempts {
        let len = file.metadata().map_err(|e| MrfError::io(path, e))?.len();
        if len >= size {
            return Ok(());
        }
        match file.set_len(size) {
            Ok(()) => continue,
            Err(e) => {
                tracing::warn!(
                    "Extending {} to {} bytes failed (attempt {}): {}",
                    path.display(),
                    size,
                    attempt + 1,
                    e
                );
                std::thread::sleep(wait.delay);
            }
        }
    }
    tracing::error!("Can't extend {} to {} bytes", path.display(), size);
    Err(MrfError::Timeout {
        path: path.to_path_buf(),
        expected: size,
        waited: wait.total(),
    })
}

/// 等待文件长度达到 `size`（另一个进程可能正在扩展它）
pub fn wait_for_size(path: &Path, size: u64, wait: &WaitPolicy) -> Result<()> {
    for _ in 0..wait.attempts {
        if file_len(path) >= size {
            return Ok(());
        }
        std::thread::sleep(wait.delay);
    }
    if file_len(path) >= size {
        return Ok(());
    }
    tracing::error!(
        "Timeout waiting for {} to reach {} bytes",
        path.display(),
        size
    );
    Err(MrfError::Timeout {
        path: path.to_path_buf(),
        expected: size,
        waited: wait.total(),
    })
}

fn open_index_file(path: &Path, write: bool, create: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .create(write && create)
        .open(path)
}

/// 索引文件句柄：首次使用时打开，随数据集生命周期缓存
pub struct IndexFile {
    path: PathBuf,
    mode: FileMode,
    wait: WaitPolicy,
    required_len: AtomicU64,
    writable: AtomicBool,
    handle: Mutex<Option<Arc<File>>>,
}

impl IndexFile {
    pub fn new(path: PathBuf, mode: FileMode, wait: WaitPolicy, required_len: u64) -> Self {
        Self {
            path,
            mode,
            wait,
            required_len: AtomicU64::new(required_len),
            writable: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn len(&self) -> u64 {
        file_len(&self.path)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 实际打开方式是否可写（缓存索引可能退化为只读）
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn required_len(&self) -> u64 {
        self.required_len.load(Ordering::Relaxed)
    }

    pub fn set_required_len(&self, len: u64) {
        self.required_len.store(len, Ordering::Relaxed);
    }

    pub fn handle(&self) -> Result<Arc<File>> {
        let mut guard = self.handle.lock();
        if let Some(f) = guard.as_ref() {
            return Ok(f.clone());
        }
        let file = Arc::new(self.open()?);
        *guard = Some(file.clone());
        Ok(file)
    }

    fn open(&self) -> Result<File> {
        let expected = self.required_len();
        let existed = self.path.exists();
        let writable = self.mode.writable();
        let create = self.mode.creating || self.mode.caching;

        let mut opened = open_index_file(&self.path, writable, create);
        if opened.is_err() && self.mode.caching {
            create_parent_dirs(&self.path);
            opened = open_index_file(&self.path, true, true);
        }

        let file = match opened {
            Ok(f) => {
                self.writable.store(writable, Ordering::Relaxed);
                f
            }
            Err(e) if self.mode.caching => match open_index_file(&self.path, false, false) {
                Ok(f) => {
                    tracing::debug!("Opened cache index {} read-only", self.path.display());
                    self.writable.store(false, Ordering::Relaxed);
                    f
                }
                Err(_) => {
                    tracing::error!(
                        "Can't create the cache index file {}: {}",
                        self.path.display(),
                        e
                    );
                    return Err(MrfError::io(&self.path, e));
                }
            },
            Err(e) => {
                tracing::error!("Can't open index file {}: {}", self.path.display(), e);
                return Err(MrfError::io(&self.path, e));
            }
        };

        // 新建（或正在创建）的索引：稀疏扩展到所需长度
        if self.is_writable() && (self.mode.creating || !existed) {
            extend_file(&file, &self.path, expected, &self.wait)?;
        }

        // 缓存索引可能正被其它进程扩展，等它到位
        if self.mode.caching {
            wait_for_size(&self.path, expected, &self.wait)?;
        }

        tracing::debug!(
            "Opened index {} ({})",
            self.path.display(),
            if self.is_writable() { "rw" } else { "ro" }
        );
        Ok(file)
    }

    /// 确保索引文件至少为 `required_len`，用于新增概览层之后
    pub fn ensure_len(&self) -> Result<()> {
        let file = self.handle()?;
        if !self.is_writable() {
            return wait_for_size(&self.path, self.required_len(), &self.wait);
        }
        extend_file(&file, &self.path, self.required_len(), &self.wait)
    }

    pub fn read_entry(&self, offset: u64) -> Result<TileIdx> {
        let file = self.handle()?;
        entry::read_entry(&file, &self.path, offset)
    }

    pub fn write_entry(&self, offset: u64, e: TileIdx) -> Result<()> {
        let file = self.handle()?;
        entry::write_entry(&file, &self.path, offset, e)
    }

    /// 读取一段原始字节；超过文件末尾的部分报错
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = self.handle()?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| MrfError::io(&self.path, e))?;
        Ok(buf)
    }

    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.handle()?;
        file.write_all_at(bytes, offset)
            .map_err(|e| MrfError::io(&self.path, e))
    }
}

/// 数据文件句柄：只读或追加模式，从不以普通写方式打开
pub struct DataFile {
    path: PathBuf,
    mode: FileMode,
    handle: Mutex<Option<Arc<File>>>,
    /// 同一句柄上的追加共享文件位置，进程内串行
    append_lock: Mutex<()>,
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

impl DataFile {
    pub fn new(path: PathBuf, mode: FileMode) -> Self {
        Self {
            path,
            mode,
            handle: Mutex::new(None),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        file_len(&self.path)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle(&self) -> Result<Arc<File>> {
        let mut guard = self.handle.lock();
        if let Some(f) = guard.as_ref() {
            return Ok(f.clone());
        }
        let file = Arc::new(self.open()?);
        *guard = Some(file.clone());
        Ok(file)
    }

    fn open(&self) -> Result<File> {
        if !self.mode.writable() {
            return File::open(&self.path).map_err(|e| {
                tracing::error!("Can't open data file {}: {}", self.path.display(), e);
                MrfError::io(&self.path, e)
            });
        }

        let err = match open_append(&self.path) {
            Ok(f) => return Ok(f),
            Err(e) => e,
        };
        if !self.mode.caching {
            tracing::error!("Can't open data file {}: {}", self.path.display(), err);
            return Err(MrfError::io(&self.path, err));
        }

        // 缓存：文件可能存在但只读
        if let Ok(f) = File::open(&self.path) {
            tracing::debug!("Opened cache data file {} read-only", self.path.display());
            return Ok(f);
        }

        // 缓存：目录可能还不存在
        create_parent_dirs(&self.path);
        open_append(&self.path).map_err(|e| {
            tracing::error!("Can't create data file {}: {}", self.path.display(), e);
            MrfError::io(&self.path, e)
        })
    }

    /// 追加到文件末尾，返回写入位置
    ///
    /// 位置取自写入之后的文件位置减去长度：append 模式下写入结束时位置
    /// 停在本次写入的末尾，其他进程在写入前后的追加不影响它。
    /// 跨进程不加锁，单次 write 被拆分时的交错仍由调用方回读校验。
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let file = self.handle()?;
        let _guard = self.append_lock.lock();
        let mut f: &File = &file;
        f.write_all(bytes)
            .map_err(|e| MrfError::io(&self.path, e))?;
        let end = f
            .stream_position()
            .map_err(|e| MrfError::io(&self.path, e))?;
        Ok(end - bytes.len() as u64)
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = self.handle()?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| MrfError::io(&self.path, e))?;
        Ok(buf)
    }
}
