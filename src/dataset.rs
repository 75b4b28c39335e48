use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::codec::codec_for;
use crate::core::config::{DatasetConfig, RsetsConfig};
use crate::core::error::{MrfError, Result};
use crate::core::geometry::{Compression, Image, TileCoord};
use crate::index::entry::{decode_block, TileIdx, CHECKED_MARKER, IDX_RECORD};
use crate::index::offset::index_offset;
use crate::index::pyramid::Pyramid;
use crate::overview::{source_tiles, RegenJob, Resampling};
use crate::stats::{DatasetReport, LevelReport};
use crate::storage::clone::{self, CloneCounters, CloneStats};
use crate::storage::files::{Access, DataFile, FileMode, IndexFile, WaitPolicy};
use crate::storage::version::VersionLog;
use crate::storage::writer::{self, TilePayload, WriteContext, WriteOutcome};

const ZERO_CHUNK: u64 = 64 * 1024;

/// 打开数据集的参数
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    pub access: Access,
    /// 打开历史版本（只读），1 为最早保存的快照
    pub version: Option<u64>,
    pub wait: WaitPolicy,
    /// mp-safe 回读校验的最大追加次数
    pub max_write_attempts: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access: Access::ReadOnly,
            version: None,
            wait: WaitPolicy::default(),
            max_write_attempts: 16,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn update() -> Self {
        Self {
            access: Access::Update,
            ..Self::default()
        }
    }

    pub fn version(mut self, slot: u64) -> Self {
        self.version = Some(slot);
        self
    }

    pub fn wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// 0 按 1 处理
    pub fn max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts;
        self
    }
}

/// 一对索引/数据文件上的瓦片栅格数据集
///
/// 文件句柄在首次使用时打开，随数据集释放而关闭。瓦片读写只需要 `&self`；
/// 多个句柄（或多个进程）可以同时写同一对文件，正确性由追加 + 回读校验保证。
/// 改变金字塔结构的操作需要 `&mut self`，并会重写描述文件。
pub struct MrfDataset {
    descriptor: PathBuf,
    config: DatasetConfig,
    options: OpenOptions,
    mode: FileMode,
    pyramid: Pyramid,
    /// 单个版本的索引长度
    idx_size: u64,
    index: Arc<IndexFile>,
    data: DataFile,
    versions: Mutex<VersionLog>,
    /// 打开历史版本时所有索引读取的偏移
    version_bias: u64,
    mp_safe: bool,
    source: Mutex<Option<Arc<MrfDataset>>>,
    clone_stats: CloneStats,
}

impl MrfDataset {
    /// 写描述文件并创建空的索引/数据文件
    pub fn create(
        descriptor: impl AsRef<Path>,
        config: DatasetConfig,
        options: OpenOptions,
    ) -> Result<Self> {
        config.validate()?;
        let descriptor = descriptor.as_ref().to_path_buf();
        config.save(&descriptor)?;
        let options = OpenOptions {
            access: Access::Update,
            version: None,
            ..options
        };
        let ds = Self::init(descriptor, config, options, true)?;
        ds.index.handle()?;
        ds.data.handle()?;
        tracing::info!(
            "Created {} ({} levels, index {} bytes)",
            ds.descriptor.display(),
            ds.pyramid.levels().len(),
            ds.idx_size
        );
        Ok(ds)
    }

    pub fn open(descriptor: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let descriptor = descriptor.as_ref().to_path_buf();
        let config = DatasetConfig::load(&descriptor)?;
        Self::init(descriptor, config, options, false)
    }

    fn init(
        descriptor: PathBuf,
        config: DatasetConfig,
        options: OpenOptions,
        creating: bool,
    ) -> Result<Self> {
        if options.version.is_some() && options.access == Access::Update {
            return Err(MrfError::Version("past versions can only be opened read-only".into()));
        }

        let mut pyramid = Pyramid::new(config.base_image());
        if let Some(rsets) = &config.rsets {
            pyramid.add_overviews(rsets.scale)?;
        }
        let idx_size = pyramid.index_length();

        let historical = options.version.is_some();
        let mode = FileMode {
            update: options.access == Access::Update,
            caching: config.is_caching() && !historical,
            creating,
        };
        let (idx_path, data_path) = config.file_paths(&descriptor);
        let idx_len = std::fs::metadata(&idx_path).map(|m| m.len()).unwrap_or(0);
        let required = idx_size * if config.is_cloned() { 2 } else { 1 };

        let versions = if config.raster.versioned {
            VersionLog::from_index_len(idx_len, idx_size)
        } else {
            VersionLog::default()
        };
        let version_bias = match options.version {
            Some(_) if !config.raster.versioned => {
                return Err(MrfError::Version(format!(
                    "{} is not versioned",
                    descriptor.display()
                )));
            }
            Some(slot) => versions.slot_bias(slot, idx_size)?,
            None => 0,
        };

        let mp_safe = config.raster.mp_safe || config.is_caching();
        tracing::debug!(
            "Opening {}: idx_size={} versions={} mp_safe={}",
            descriptor.display(),
            idx_size,
            versions.count(),
            mp_safe
        );

        Ok(Self {
            index: Arc::new(IndexFile::new(idx_path, mode, options.wait, required)),
            data: DataFile::new(data_path, mode),
            descriptor,
            config,
            options,
            mode,
            pyramid,
            idx_size,
            versions: Mutex::new(versions),
            version_bias,
            mp_safe,
            source: Mutex::new(None),
            clone_stats: CloneStats::default(),
        })
    }

    pub fn descriptor(&self) -> &Path {
        &self.descriptor
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn levels(&self) -> &[Image] {
        self.pyramid.levels()
    }

    pub fn idx_size(&self) -> u64 {
        self.idx_size
    }

    pub fn version_count(&self) -> u64 {
        self.versions.lock().count()
    }

    pub fn clone_counters(&self) -> CloneCounters {
        self.clone_stats.snapshot()
    }

    fn level(&self, level: usize) -> Result<&Image> {
        self.pyramid.level(level).ok_or_else(|| MrfError::InvalidTile {
            coord: TileCoord::new(level, 0, 0),
            reason: format!("dataset has {} levels", self.pyramid.levels().len()),
        })
    }

    /// 瓦片在当前版本索引中的字节偏移
    pub fn tile_index_offset(&self, coord: &TileCoord) -> Result<u64> {
        index_offset(self.level(coord.level)?, coord)
    }

    /// 读取瓦片定位记录（不触发缓存拉取）
    ///
    /// 无压缩且没有索引文件的只读数据集按页号直接计算位置。
    pub fn read_tile_entry(&self, coord: &TileCoord) -> Result<TileIdx> {
        let off = self.tile_index_offset(coord)? + self.version_bias;
        let img = self.level(coord.level)?;
        if !self.mode.writable() && img.compression == Compression::None && !self.index.exists() {
            let record = off / IDX_RECORD;
            return Ok(TileIdx::new(
                record * img.page_size_bytes,
                img.page_size_bytes,
            ));
        }
        self.index.read_entry(off)
    }

    /// 读取瓦片的已编码字节；缺失或空瓦片返回 None
    ///
    /// 缓存数据集遇到从未检查过的瓦片时会先从源数据集拉取。
    pub fn read_tile(&self, coord: &TileCoord) -> Result<Option<Vec<u8>>> {
        let mut entry = self.read_tile_entry(coord)?;
        if entry.is_empty() && self.can_fetch()? {
            entry = self.fetch_from_source(coord)?;
        }
        if !entry.is_present() {
            return Ok(None);
        }
        Ok(Some(self.data.read_at(entry.offset, entry.size)?))
    }

    /// 读取并解码一页像素
    pub fn read_page(&self, coord: &TileCoord) -> Result<Option<Vec<u8>>> {
        let img = self.level(coord.level)?;
        match self.read_tile(coord)? {
            Some(bytes) => Ok(Some(codec_for(img)?.decompress(img, &bytes)?)),
            None => Ok(None),
        }
    }

    /// 在指定索引偏移写入瓦片（多进程安全写协议）
    pub fn write_tile(&self, payload: TilePayload<'_>, idx_offset: u64) -> Result<WriteOutcome> {
        if self.options.access != Access::Update {
            return Err(MrfError::ReadOnly);
        }
        self.store(payload, idx_offset)
    }

    /// 编码并写入一页像素
    pub fn write_page(&self, coord: &TileCoord, raw: &[u8]) -> Result<WriteOutcome> {
        let img = self.level(coord.level)?;
        let encoded = codec_for(img)?.compress(img, raw)?;
        let off = self.tile_index_offset(coord)?;
        self.write_tile(TilePayload::Data(&encoded), off)
    }

    pub fn erase_tile(&self, coord: &TileCoord) -> Result<WriteOutcome> {
        let off = self.tile_index_offset(coord)?;
        self.write_tile(TilePayload::Erase, off)
    }

    fn store(&self, payload: TilePayload<'_>, idx_offset: u64) -> Result<WriteOutcome> {
        if self.version_bias != 0 {
            return Err(MrfError::ReadOnly);
        }
        self.index.handle()?;
        if !self.index.is_writable() {
            return Err(MrfError::ReadOnly);
        }
        let mut guard = self.config.raster.versioned.then(|| self.versions.lock());
        let mut ctx = WriteContext {
            index: &self.index,
            data: &self.data,
            idx_size: self.idx_size,
            versions: guard.as_deref_mut(),
            mp_safe: self.mp_safe,
            max_attempts: self.options.max_write_attempts,
        };
        writer::write_tile(&mut ctx, payload, idx_offset)
    }

    /// 解析 bias 区中的索引项；`bias == 0` 时直接读取当前版本
    pub fn resolve_index_entry(&self, coord: &TileCoord, bias: u64) -> Result<TileIdx> {
        let off = self.tile_index_offset(coord)?;
        clone::resolve_entry(&self.index, off, bias, &self.clone_stats, || {
            Ok(self.source()?.index.clone())
        })
    }

    // 只有当前版本、且索引能以可写方式打开的缓存才拉取
    fn can_fetch(&self) -> Result<bool> {
        if !self.config.is_caching() || self.version_bias != 0 {
            return Ok(false);
        }
        self.index.handle()?;
        Ok(self.index.is_writable())
    }

    /// 从源数据集拉取一个瓦片并写入本地；源中不存在时记录已检查标记
    pub fn fetch_from_source(&self, coord: &TileCoord) -> Result<TileIdx> {
        let off = self.tile_index_offset(coord)?;
        let bytes = if self.config.is_cloned() {
            let remote = self.resolve_index_entry(coord, self.idx_size)?;
            if remote.is_present() {
                Some(self.source()?.data.read_at(remote.offset, remote.size)?)
            } else {
                None
            }
        } else {
            self.source()?.read_tile(coord)?
        };

        match bytes {
            Some(b) => {
                self.clone_stats.record_tile();
                self.store(TilePayload::Data(&b), off)?;
            }
            None => {
                self.clone_stats.record_absent();
                self.store(TilePayload::Marker(CHECKED_MARKER), off)?;
            }
        }
        self.index.read_entry(off)
    }

    fn source(&self) -> Result<Arc<MrfDataset>> {
        let mut guard = self.source.lock();
        if let Some(src) = guard.as_ref() {
            return Ok(src.clone());
        }
        let path = self
            .config
            .source_path(&self.descriptor)
            .ok_or_else(|| MrfError::config("dataset has no cached source"))?;
        let src = MrfDataset::open(&path, OpenOptions::read_only().wait(self.options.wait))?;

        // 瓦片字节原样复制，两边的页格式必须一致
        let (mine, theirs) = (self.pyramid.base(), src.pyramid.base());
        if mine.size != theirs.size
            || mine.page_size != theirs.page_size
            || mine.data_type != theirs.data_type
            || mine.compression != theirs.compression
            || mine.net_byte_order != theirs.net_byte_order
        {
            return Err(MrfError::config(format!(
                "cached source {} has a different tile format",
                path.display()
            )));
        }
        if self.config.is_cloned() && src.idx_size != self.idx_size {
            return Err(MrfError::config(format!(
                "cloned source {} has a different pyramid",
                path.display()
            )));
        }
        tracing::debug!("Opened cached source {}", path.display());
        let src = Arc::new(src);
        *guard = Some(src.clone());
        Ok(src)
    }

    fn require_update(&self) -> Result<()> {
        if self.options.access != Access::Update || self.version_bias != 0 {
            return Err(MrfError::ReadOnly);
        }
        Ok(())
    }

    /// 按统一缩放系数登记概览层，扩展索引文件并写回描述文件
    ///
    /// 返回整个金字塔的索引长度。对已建好的金字塔重复调用不会改变任何东西。
    pub fn add_overviews(&mut self, scale: u64) -> Result<u64> {
        self.require_update()?;
        if self.config.is_cloned() {
            return Err(MrfError::Unsupported(
                "a cloned cache takes its pyramid from the source".into(),
            ));
        }
        let mut next = self.pyramid.clone();
        let len = next.add_overviews(scale)?;
        if len != self.idx_size && self.version_count() > 0 {
            return Err(MrfError::Version(
                "can't grow the pyramid of a dataset that already holds versions".into(),
            ));
        }

        self.pyramid = next;
        self.idx_size = len;
        self.index.set_required_len(len);
        self.index.ensure_len()?;

        let rsets = Some(RsetsConfig::uniform(scale));
        if self.config.rsets != rsets {
            self.config.rsets = rsets;
            self.config.save(&self.descriptor)?;
        }
        tracing::info!(
            "{}: {} overview levels, index {} bytes",
            self.descriptor.display(),
            self.pyramid.overview_count(),
            len
        );
        Ok(len)
    }

    /// 从上一层重新生成第 `level` 层的全部页，返回写入的页数
    ///
    /// 解码与重采样按行并行，写入串行。没有任何源页的目标页跳过。
    pub fn build_overview_level(&self, level: usize, resampling: &Resampling<'_>) -> Result<usize> {
        self.require_update()?;
        if level == 0 || level >= self.pyramid.levels().len() {
            return Err(MrfError::config(format!("level {} is not an overview level", level)));
        }
        let scale = self
            .pyramid
            .scale()
            .ok_or_else(|| MrfError::config("pyramid has no scale"))?;
        let source = self.level(level - 1)?;
        let target = self.level(level)?;
        let codec = codec_for(target)?;
        let regen = resampling.regenerator();

        let mut written = 0;
        for z in 0..target.size.z {
            for band in 0..target.page_count.c {
                for y in 0..target.page_count.y {
                    let pages: Vec<(TileCoord, Vec<u8>)> = (0..target.page_count.x)
                        .into_par_iter()
                        .map(|x| -> Result<Option<(TileCoord, Vec<u8>)>> {
                            let coord = TileCoord {
                                level,
                                z,
                                band,
                                y,
                                x,
                            };
                            let mut job = RegenJob {
                                source,
                                target,
                                coord,
                                scale,
                                sources: Default::default(),
                            };
                            for src in source_tiles(source, target, &coord, scale) {
                                if let Some(page) = self.read_page(&src)? {
                                    job.sources.insert((src.x, src.y), page);
                                }
                            }
                            if job.sources.is_empty() {
                                return Ok(None);
                            }
                            let raw = regen.regenerate(&job)?;
                            Ok(Some((coord, codec.compress(target, &raw)?)))
                        })
                        .collect::<Result<Vec<_>>>()?
                        .into_iter()
                        .flatten()
                        .collect();

                    for (coord, encoded) in pages {
                        let off = index_offset(target, &coord)?;
                        self.store(TilePayload::Data(&encoded), off)?;
                        written += 1;
                    }
                }
            }
        }
        tracing::info!(
            "Built overview level {} ({:?}): {} pages",
            level,
            resampling,
            written
        );
        Ok(written)
    }

    /// 生成一组概览倍数对应的层级，返回实际生成的层号
    ///
    /// 尚未设置缩放系数时以第一个倍数为准登记金字塔。不是缩放系数整数次幂、
    /// 或超出金字塔的倍数只警告并跳过。
    pub fn build_overviews(&mut self, factors: &[u64], resampling: &Resampling<'_>) -> Result<Vec<usize>> {
        self.require_update()?;
        let Some(&first) = factors.first() else {
            return Ok(Vec::new());
        };
        if self.pyramid.scale().is_none() {
            self.add_overviews(first)?;
        }
        let scale = self
            .pyramid
            .scale()
            .ok_or_else(|| MrfError::config("pyramid has no scale"))?;

        let mut levels = Vec::new();
        for &factor in factors {
            match log_scale(factor, scale) {
                Some(l) if l >= 1 && l < self.pyramid.levels().len() => levels.push(l),
                _ => tracing::warn!(
                    "Overview factor {} is not an available power of {}, skipped",
                    factor,
                    scale
                ),
            }
        }
        levels.sort_unstable();
        levels.dedup();

        for &l in &levels {
            self.build_overview_level(l, resampling)?;
        }
        Ok(levels)
    }

    /// 删除概览层：清零其索引区并从描述文件移除 `[rsets]`，文件不截断
    pub fn clean_overviews(&mut self) -> Result<()> {
        self.require_update()?;
        if self.config.raster.versioned {
            return Err(MrfError::Version(
                "overviews of a versioned dataset can't be removed".into(),
            ));
        }
        if self.config.is_cloned() {
            return Err(MrfError::Unsupported(
                "a cloned cache takes its pyramid from the source".into(),
            ));
        }
        if let Some((start, end)) = self.pyramid.clear_overviews() {
            let zeros = vec![0u8; ZERO_CHUNK as usize];
            let mut pos = start;
            while pos < end {
                let n = ZERO_CHUNK.min(end - pos);
                self.index.write_bytes(pos, &zeros[..n as usize])?;
                pos += n;
            }
            tracing::info!(
                "Cleared overview index region {}..{} of {}",
                start,
                end,
                self.index.path().display()
            );
        }
        self.idx_size = self.pyramid.index_length();
        self.index.set_required_len(self.idx_size);
        if self.config.rsets.take().is_some() {
            self.config.save(&self.descriptor)?;
        }
        Ok(())
    }

    pub fn report(&self) -> Result<DatasetReport> {
        let mut levels = Vec::with_capacity(self.pyramid.levels().len());
        for img in self.pyramid.levels() {
            levels.push(LevelReport {
                level: img.level(),
                width: img.size.x,
                height: img.size.y,
                pages_x: img.page_count.x,
                pages_y: img.page_count.y,
                pages: img.page_count.l,
                idx_offset: img.idx_offset,
                present: self.count_present(img)?,
            });
        }
        Ok(DatasetReport {
            descriptor: self.descriptor.display().to_string(),
            compression: format!("{:?}", self.pyramid.base().compression),
            levels,
            idx_size: self.idx_size,
            version_count: self.version_count(),
            index_file_bytes: self.index.len(),
            data_file_bytes: self.data.len(),
            cloned: self.config.is_cloned(),
            clone: self.clone_counters(),
        })
    }

    fn count_present(&self, img: &Image) -> Result<u64> {
        if !self.index.exists() {
            return Ok(0);
        }
        let start = img.idx_offset + self.version_bias;
        let end = (start + img.index_length()).min(self.index.len());
        if end <= start {
            return Ok(0);
        }
        let bytes = self.index.read_bytes(start, end - start)?;
        Ok(decode_block(&bytes).iter().filter(|e| e.is_present()).count() as u64)
    }
}

/// `factor == scale^n` 时返回 n
fn log_scale(factor: u64, scale: u64) -> Option<usize> {
    let mut level = 0;
    let mut v = 1u64;
    while v < factor {
        v = v.checked_mul(scale)?;
        level += 1;
    }
    (v == factor).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CachedSourceConfig, PageDims};
    use crate::core::geometry::DataType;
    use crate::index::entry::CHECKED;
    use std::time::Duration;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mrf-dataset-{}-{}", tag, nanos))
    }

    fn config(x: u64, y: u64, page: u64, comp: Compression) -> DatasetConfig {
        let mut cfg = DatasetConfig::new(x, y);
        cfg.raster.compression = comp;
        cfg.raster.page_size = Some(PageDims {
            x: page,
            y: page,
            c: None,
        });
        cfg
    }

    fn page(img: &Image, v: u8) -> Vec<u8> {
        vec![v; img.page_size_bytes as usize]
    }

    #[test]
    fn write_then_read_page_across_handles() {
        let dir = unique_tmp_dir("rw");
        let desc = dir.join("a.toml");
        let ds = MrfDataset::create(&desc, config(256, 256, 128, Compression::Deflate), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        let c = TileCoord::new(0, 1, 0);
        ds.write_page(&c, &page(&img, 42)).unwrap();
        assert_eq!(ds.read_page(&c).unwrap(), Some(page(&img, 42)));
        assert_eq!(ds.read_page(&TileCoord::new(0, 0, 0)).unwrap(), None);
        drop(ds);

        let ro = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(ro.read_page(&c).unwrap(), Some(page(&img, 42)));
        assert!(matches!(ro.erase_tile(&c), Err(MrfError::ReadOnly)));
        assert!(dir.join("a.idx").exists());
        assert!(dir.join("a.pzp").exists());
    }

    #[test]
    fn write_attempt_cap_is_configurable() {
        let dir = unique_tmp_dir("cap");
        let mut cfg = config(64, 64, 64, Compression::None);
        cfg.raster.mp_safe = true;
        let opts = OpenOptions::update().max_write_attempts(1);
        assert_eq!(opts.max_write_attempts, 1);
        let ds = MrfDataset::create(dir.join("cap.toml"), cfg, opts).unwrap();
        let img = ds.levels()[0].clone();
        let out = ds.write_page(&TileCoord::new(0, 0, 0), &page(&img, 3)).unwrap();
        assert!(matches!(out, WriteOutcome::Written { attempts: 1, .. }));
        assert_eq!(OpenOptions::default().max_write_attempts, 16);
    }

    #[test]
    fn rewriting_same_page_appends_nothing() {
        let dir = unique_tmp_dir("idem");
        let ds = MrfDataset::create(dir.join("b.toml"), config(64, 64, 64, Compression::None), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        let c = TileCoord::new(0, 0, 0);
        ds.write_page(&c, &page(&img, 9)).unwrap();
        let len = ds.report().unwrap().data_file_bytes;
        assert_eq!(ds.write_page(&c, &page(&img, 9)).unwrap(), WriteOutcome::Unchanged);
        assert_eq!(ds.report().unwrap().data_file_bytes, len);
    }

    #[test]
    fn versions_preserve_previous_tiles() {
        let dir = unique_tmp_dir("versions");
        let desc = dir.join("v.toml");
        let mut cfg = config(128, 128, 64, Compression::None);
        cfg.raster.versioned = true;
        let ds = MrfDataset::create(&desc, cfg, OpenOptions::update()).unwrap();
        let img = ds.levels()[0].clone();
        let c = TileCoord::new(0, 1, 1);
        ds.write_page(&c, &page(&img, 1)).unwrap();
        ds.write_page(&TileCoord::new(0, 0, 0), &page(&img, 5)).unwrap();
        assert_eq!(ds.version_count(), 0);
        ds.write_page(&c, &page(&img, 2)).unwrap();
        assert_eq!(ds.version_count(), 1);
        ds.write_page(&TileCoord::new(0, 0, 1), &page(&img, 3)).unwrap();
        assert_eq!(ds.version_count(), 1);
        drop(ds);

        let current = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(current.version_count(), 1);
        assert_eq!(current.read_page(&c).unwrap(), Some(page(&img, 2)));

        let past = MrfDataset::open(&desc, OpenOptions::read_only().version(1)).unwrap();
        assert_eq!(past.read_page(&c).unwrap(), Some(page(&img, 1)));
        assert_eq!(past.read_page(&TileCoord::new(0, 0, 1)).unwrap(), None);
        assert!(matches!(
            past.write_tile(TilePayload::Erase, 0),
            Err(MrfError::ReadOnly)
        ));

        assert!(matches!(
            MrfDataset::open(&desc, OpenOptions::read_only().version(2)),
            Err(MrfError::Version(_))
        ));
        assert!(matches!(
            MrfDataset::open(&desc, OpenOptions::update().version(1)),
            Err(MrfError::Version(_))
        ));
    }

    #[test]
    fn erase_and_marker_are_distinguishable() {
        let dir = unique_tmp_dir("erase");
        let ds = MrfDataset::create(dir.join("e.toml"), config(64, 64, 32, Compression::None), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        let c = TileCoord::new(0, 1, 1);
        assert_eq!(ds.erase_tile(&c).unwrap(), WriteOutcome::Unchanged);

        let off = ds.tile_index_offset(&c).unwrap();
        ds.write_tile(TilePayload::Marker(CHECKED_MARKER), off).unwrap();
        assert!(ds.resolve_index_entry(&c, 0).unwrap().is_marked_empty());
        assert_eq!(ds.read_tile(&c).unwrap(), None);

        ds.write_page(&c, &page(&img, 3)).unwrap();
        ds.erase_tile(&c).unwrap();
        assert!(ds.resolve_index_entry(&c, 0).unwrap().is_empty());
    }

    #[test]
    fn add_overviews_is_idempotent_on_file_length() {
        let dir = unique_tmp_dir("ovr");
        let desc = dir.join("o.toml");
        let mut ds = MrfDataset::create(&desc, config(128, 128, 64, Compression::None), OpenOptions::update())
            .unwrap();
        assert_eq!(ds.idx_size(), 64);
        assert_eq!(ds.add_overviews(2).unwrap(), 80);
        let len = std::fs::metadata(dir.join("o.idx")).unwrap().len();
        assert_eq!(len, 80);
        assert_eq!(ds.add_overviews(2).unwrap(), 80);
        assert_eq!(std::fs::metadata(dir.join("o.idx")).unwrap().len(), len);
        assert!(ds.add_overviews(3).is_err());

        let reopened = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(reopened.levels().len(), 2);
        assert_eq!(reopened.idx_size(), 80);
    }

    #[test]
    fn versioned_dataset_with_versions_cannot_grow() {
        let dir = unique_tmp_dir("grow");
        let mut cfg = config(128, 128, 64, Compression::None);
        cfg.raster.versioned = true;
        let mut ds = MrfDataset::create(dir.join("g.toml"), cfg, OpenOptions::update()).unwrap();
        let img = ds.levels()[0].clone();
        let c = TileCoord::new(0, 0, 0);
        ds.write_page(&c, &page(&img, 1)).unwrap();
        ds.write_page(&c, &page(&img, 2)).unwrap();
        assert_eq!(ds.version_count(), 1);
        assert!(matches!(ds.add_overviews(2), Err(MrfError::Version(_))));
    }

    #[test]
    fn build_overviews_averages_quadrants() {
        let dir = unique_tmp_dir("build");
        let desc = dir.join("p.toml");
        let mut ds = MrfDataset::create(&desc, config(128, 128, 64, Compression::Deflate), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        for (x, y, v) in [(0, 0, 10u8), (1, 0, 20), (0, 1, 30), (1, 1, 40)] {
            ds.write_page(&TileCoord::new(0, x, y), &page(&img, v)).unwrap();
        }

        let built = ds.build_overviews(&[2, 3], &Resampling::Average).unwrap();
        assert_eq!(built, vec![1]);
        assert_eq!(ds.config().rsets, Some(RsetsConfig::uniform(2)));

        let top = ds.read_page(&TileCoord::new(1, 0, 0)).unwrap().unwrap();
        let l1 = ds.levels()[1].clone();
        assert_eq!(top[l1.sample_index(0, 0, 0)], 10);
        assert_eq!(top[l1.sample_index(63, 0, 0)], 20);
        assert_eq!(top[l1.sample_index(0, 63, 0)], 30);
        assert_eq!(top[l1.sample_index(63, 63, 0)], 40);
        assert_eq!(ds.report().unwrap().levels[1].present, 1);
    }

    #[test]
    fn overviews_keep_z_slices_apart() {
        let dir = unique_tmp_dir("slices");
        let mut cfg = config(128, 128, 64, Compression::Deflate);
        cfg.raster.size.z = 3;
        let mut ds = MrfDataset::create(dir.join("z.toml"), cfg, OpenOptions::update()).unwrap();
        let img = ds.levels()[0].clone();
        for z in 0..3u64 {
            let v = 10 * (z as u8 + 1);
            for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                ds.write_page(&TileCoord::new(0, x, y).with_slice(z), &page(&img, v))
                    .unwrap();
            }
        }

        ds.build_overviews(&[2], &Resampling::Average).unwrap();
        let layout: Vec<(u64, u64)> = ds
            .levels()
            .iter()
            .map(|l| (l.idx_offset, l.page_count.l))
            .collect();
        assert_eq!(layout, vec![(0, 12), (192, 3)]);
        assert_eq!(ds.idx_size(), 240);

        for z in 0..3u64 {
            let top = ds
                .read_page(&TileCoord::new(1, 0, 0).with_slice(z))
                .unwrap()
                .unwrap();
            let v = 10 * (z as u8 + 1);
            assert!(top.iter().all(|s| *s == v), "slice {} mixed with others", z);
        }
        assert_eq!(ds.report().unwrap().levels[1].present, 3);
    }

    #[test]
    fn build_overviews_skips_levels_without_sources() {
        let dir = unique_tmp_dir("sparse");
        let mut ds = MrfDataset::create(dir.join("s.toml"), config(256, 256, 64, Compression::None), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        ds.write_page(&TileCoord::new(0, 3, 3), &page(&img, 7)).unwrap();
        ds.build_overviews(&[2, 4], &Resampling::Nearest).unwrap();
        assert_eq!(ds.read_page(&TileCoord::new(1, 0, 0)).unwrap(), None);
        let l1 = ds.read_page(&TileCoord::new(1, 1, 1)).unwrap().unwrap();
        assert_eq!(l1[l1.len() - 1], 7);
        assert_eq!(l1[0], 0);
        assert!(ds.read_page(&TileCoord::new(2, 0, 0)).unwrap().is_some());
    }

    #[test]
    fn clean_overviews_zeroes_index_region() {
        let dir = unique_tmp_dir("clean");
        let desc = dir.join("c.toml");
        let mut ds = MrfDataset::create(&desc, config(128, 128, 64, Compression::None), OpenOptions::update())
            .unwrap();
        let img = ds.levels()[0].clone();
        ds.write_page(&TileCoord::new(0, 0, 0), &page(&img, 1)).unwrap();
        ds.build_overviews(&[2], &Resampling::Average).unwrap();
        assert!(ds.read_tile_entry(&TileCoord::new(1, 0, 0)).unwrap().is_present());

        ds.clean_overviews().unwrap();
        assert_eq!(ds.levels().len(), 1);
        assert_eq!(ds.idx_size(), 64);
        assert_eq!(std::fs::metadata(dir.join("c.idx")).unwrap().len(), 80);
        let bytes = std::fs::read(dir.join("c.idx")).unwrap();
        assert!(bytes[64..].iter().all(|b| *b == 0));
        assert!(DatasetConfig::load(&desc).unwrap().rsets.is_none());
    }

    #[test]
    fn raw_dataset_without_index_uses_page_number() {
        let dir = unique_tmp_dir("noidx");
        let desc = dir.join("r.toml");
        let cfg = config(64, 32, 32, Compression::None);
        cfg.save(&desc).unwrap();
        let mut raw = vec![0u8; 32 * 32];
        raw.extend(vec![5u8; 32 * 32]);
        std::fs::write(dir.join("r.til"), &raw).unwrap();

        let ds = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(
            ds.read_tile_entry(&TileCoord::new(0, 1, 0)).unwrap(),
            TileIdx::new(32 * 32, 32 * 32)
        );
        assert_eq!(ds.read_page(&TileCoord::new(0, 1, 0)).unwrap(), Some(vec![5u8; 32 * 32]));
    }

    fn remote_with_tiles(dir: &Path) -> (PathBuf, Image) {
        let desc = dir.join("remote.toml");
        let mut cfg = config(256, 256, 64, Compression::Deflate);
        cfg.raster.data_type = DataType::Byte;
        let ds = MrfDataset::create(&desc, cfg, OpenOptions::update()).unwrap();
        let img = ds.levels()[0].clone();
        ds.write_page(&TileCoord::new(0, 1, 0), &page(&img, 11)).unwrap();
        ds.write_page(&TileCoord::new(0, 2, 3), &page(&img, 22)).unwrap();
        (desc, img)
    }

    fn local_cache(dir: &Path, clone: bool) -> PathBuf {
        let desc = dir.join("cache").join("local.toml");
        let mut cfg = config(256, 256, 64, Compression::Deflate);
        cfg.cached_source = Some(CachedSourceConfig {
            source: PathBuf::from("../remote.toml"),
            clone,
        });
        cfg.save(&desc).unwrap();
        desc
    }

    #[test]
    fn cloned_cache_fetches_blocks_once() {
        let dir = unique_tmp_dir("clone");
        let (_, img) = remote_with_tiles(&dir);
        let desc = local_cache(&dir, true);

        let cache = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        let present = TileCoord::new(0, 1, 0);
        assert_eq!(cache.read_page(&present).unwrap(), Some(page(&img, 11)));
        assert_eq!(cache.clone_counters().block_fetches, 1);
        assert_eq!(cache.clone_counters().tiles_fetched, 1);
        assert_eq!(std::fs::metadata(dir.join("cache").join("local.idx")).unwrap().len(), 2 * cache.idx_size());

        let absent = TileCoord::new(0, 3, 3);
        assert_eq!(cache.read_tile(&absent).unwrap(), None);
        assert!(cache.resolve_index_entry(&absent, 0).unwrap().is_marked_empty());
        assert_eq!(cache.read_tile(&absent).unwrap(), None);

        let counters = cache.clone_counters();
        assert_eq!(counters.block_fetches, 1);
        assert_eq!(counters.remote_absent, 1);

        // bias 区中同一块的其它空记录已标记
        let other = cache.resolve_index_entry(&TileCoord::new(0, 0, 1), cache.idx_size()).unwrap();
        assert_eq!(other, TileIdx::new(CHECKED, 0));
        assert_eq!(cache.clone_counters().block_fetches, 1);
        drop(cache);

        // 本地副本不依赖远端
        let again = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(again.read_page(&present).unwrap(), Some(page(&img, 11)));
        assert_eq!(again.clone_counters().tiles_fetched, 0);
    }

    #[test]
    fn plain_cache_copies_tiles_from_source() {
        let dir = unique_tmp_dir("cache");
        let (_, img) = remote_with_tiles(&dir);
        let desc = local_cache(&dir, false);
        let cache = MrfDataset::open(&desc, OpenOptions::read_only()).unwrap();
        assert_eq!(cache.read_page(&TileCoord::new(0, 2, 3)).unwrap(), Some(page(&img, 22)));
        assert_eq!(cache.read_page(&TileCoord::new(0, 0, 0)).unwrap(), None);
        let counters = cache.clone_counters();
        assert_eq!(counters.tiles_fetched, 1);
        assert_eq!(counters.remote_absent, 1);
        assert_eq!(counters.block_fetches, 0);
        assert_eq!(std::fs::metadata(dir.join("cache").join("local.idx")).unwrap().len(), cache.idx_size());
    }

    #[test]
    fn short_cache_index_times_out() {
        let dir = unique_tmp_dir("short");
        remote_with_tiles(&dir);
        let desc = local_cache(&dir, true);
        std::fs::write(dir.join("cache").join("local.idx"), [0u8; 16]).unwrap();
        let wait = WaitPolicy {
            attempts: 2,
            delay: Duration::from_millis(5),
        };
        let cache = MrfDataset::open(&desc, OpenOptions::read_only().wait(wait)).unwrap();
        assert!(matches!(
            cache.read_tile(&TileCoord::new(0, 0, 0)),
            Err(MrfError::Timeout { .. })
        ));
    }

    #[test]
    fn log_scale_matches_powers() {
        assert_eq!(log_scale(1, 2), Some(0));
        assert_eq!(log_scale(8, 2), Some(3));
        assert_eq!(log_scale(6, 2), None);
        assert_eq!(log_scale(9, 3), Some(2));
    }
}
