use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{MrfError, Result};
use crate::core::geometry::{Compression, DataType, Image, Interleave, Size};

/// 数据集描述文件（TOML）
///
/// ```toml
/// [raster]
/// size = { x = 4096, y = 4096, c = 3 }
/// page_size = { x = 512, y = 512 }
/// compression = "DEFLATE"
/// versioned = true
///
/// [rsets]
/// scale = 2
///
/// [cached_source]
/// source = "../remote/world.toml"
/// clone = true
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub raster: RasterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsets: Option<RsetsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_source: Option<CachedSourceConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RasterConfig {
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Interleave>,
    #[serde(default)]
    pub net_byte_order: bool,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file: Option<PathBuf>,
    #[serde(default)]
    pub versioned: bool,
    #[serde(default)]
    pub mp_safe: bool,
    // TOML：表类型字段须排在标量之后
    pub size: Dims,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<PageDims>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub x: u64,
    pub y: u64,
    #[serde(default = "one")]
    pub z: u64,
    #[serde(default = "one")]
    pub c: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDims {
    pub x: u64,
    pub y: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RsetsConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_scale")]
    pub scale: u64,
}

impl RsetsConfig {
    pub fn uniform(scale: u64) -> Self {
        Self {
            model: default_model(),
            scale,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedSourceConfig {
    pub source: PathBuf,
    #[serde(default)]
    pub clone: bool,
}

fn one() -> u64 {
    1
}

fn default_quality() -> u8 {
    85
}

fn default_model() -> String {
    "uniform".to_string()
}

fn default_scale() -> u64 {
    2
}

const DEFAULT_PAGE: u64 = 512;

impl DatasetConfig {
    /// 最小配置：单波段 Byte，默认页大小
    pub fn new(x: u64, y: u64) -> Self {
        Self {
            raster: RasterConfig {
                data_type: DataType::default(),
                compression: Compression::default(),
                order: None,
                net_byte_order: false,
                quality: default_quality(),
                data_file: None,
                index_file: None,
                versioned: false,
                mp_safe: false,
                size: Dims { x, y, z: 1, c: 1 },
                page_size: None,
            },
            rsets: None,
            cached_source: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| MrfError::io(path, e))?;
        let config: DatasetConfig = toml::from_str(&text)
            .map_err(|e| MrfError::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| MrfError::config(format!("can't serialize descriptor: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MrfError::io(parent, e))?;
            }
        }
        std::fs::write(path, text).map_err(|e| MrfError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.raster;
        if r.size.x < 1 || r.size.y < 1 {
            return Err(MrfError::config("raster size missing"));
        }
        if r.size.z < 1 || r.size.c < 1 {
            return Err(MrfError::config("raster z and band counts must be at least 1"));
        }
        if let Some(p) = r.page_size {
            if p.x < 1 || p.y < 1 || p.c == Some(0) {
                return Err(MrfError::config("page size must be at least 1"));
            }
        }
        if let Some(rsets) = &self.rsets {
            if !rsets.model.eq_ignore_ascii_case("uniform") {
                return Err(MrfError::config(format!(
                    "unknown rset model {}",
                    rsets.model
                )));
            }
            if rsets.scale <= 1 {
                return Err(MrfError::config("zoom factor less than 2 not allowed"));
            }
        }
        if r.versioned && self.is_cloned() {
            return Err(MrfError::config("a cloned cache can't be versioned"));
        }
        Ok(())
    }

    pub fn is_caching(&self) -> bool {
        self.cached_source.is_some()
    }

    pub fn is_cloned(&self) -> bool {
        self.cached_source.as_ref().is_some_and(|s| s.clone)
    }

    /// 全分辨率层描述（索引偏移为 0）
    pub fn base_image(&self) -> Image {
        let r = &self.raster;
        let size = Size::new(r.size.x, r.size.y, r.size.z, r.size.c);
        let page = r.page_size.unwrap_or(PageDims {
            x: DEFAULT_PAGE.min(r.size.x),
            y: DEFAULT_PAGE.min(r.size.y),
            c: None,
        });
        let page_c = page.c.unwrap_or(r.size.c).min(r.size.c);
        let order = r.order.unwrap_or(if page_c != r.size.c {
            Interleave::Band
        } else {
            Interleave::Pixel
        });
        let mut img = Image::new(
            size,
            Size::new(page.x, page.y, 1, page_c),
            r.data_type,
            r.compression,
            order,
        );
        img.net_byte_order = r.net_byte_order;
        img.quality = if r.quality > 99 { 85 } else { r.quality };
        img
    }

    /// 解析索引/数据文件路径；相对路径以描述文件所在目录为基准
    pub fn file_paths(&self, descriptor: &Path) -> (PathBuf, PathBuf) {
        let dir = descriptor.parent().unwrap_or_else(|| Path::new(""));
        let resolve = |explicit: &Option<PathBuf>, ext: &str| match explicit {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => dir.join(p),
            None => descriptor.with_extension(ext),
        };
        (
            resolve(&self.raster.index_file, "idx"),
            resolve(&self.raster.data_file, self.raster.compression.extension()),
        )
    }

    /// 缓存源描述文件路径
    pub fn source_path(&self, descriptor: &Path) -> Option<PathBuf> {
        let src = &self.cached_source.as_ref()?.source;
        if src.is_absolute() {
            return Some(src.clone());
        }
        let dir = descriptor.parent().unwrap_or_else(|| Path::new(""));
        Some(dir.join(src))
    }
}
