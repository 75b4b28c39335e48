use serde::{Deserialize, Serialize};

use crate::index::entry::IDX_RECORD;

/// 五元尺寸：x/y/z/c 四个轴 + l
///
/// `l` 在不同场合含义不同：
/// - 影像尺寸：金字塔层级（0 = 全分辨率）
/// - 页数：该层所有页的总数（x*y*z*c）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub c: u64,
    pub l: u64,
}

impl Size {
    pub fn new(x: u64, y: u64, z: u64, c: u64) -> Self {
        Self { x, y, z, c, l: 0 }
    }
}

/// 向上取整除法（页数统一用 ceil）
pub fn pcount(n: u64, sz: u64) -> u64 {
    n.div_ceil(sz.max(1))
}

/// 按页大小计算各轴页数，`l` 为总页数
pub fn page_count(size: &Size, page: &Size) -> Size {
    let x = pcount(size.x, page.x);
    let y = pcount(size.y, page.y);
    let z = pcount(size.z, page.z);
    let c = pcount(size.c, page.c);
    Size {
        x,
        y,
        z,
        c,
        l: x * y * z * c,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// 读取第 `i` 个样本（主机字节序）
    pub fn read_sample(self, buf: &[u8], i: usize) -> f64 {
        let n = self.size_bytes();
        let b = &buf[i * n..(i + 1) * n];
        match self {
            DataType::Byte => b[0] as f64,
            DataType::UInt16 => u16::from_ne_bytes([b[0], b[1]]) as f64,
            DataType::Int16 => i16::from_ne_bytes([b[0], b[1]]) as f64,
            DataType::UInt32 => u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DataType::Int32 => i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DataType::Float32 => f32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DataType::Float64 => {
                f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }

    /// 写入第 `i` 个样本；整数类型四舍五入并截断到值域
    pub fn write_sample(self, buf: &mut [u8], i: usize, v: f64) {
        let n = self.size_bytes();
        let out = &mut buf[i * n..(i + 1) * n];
        match self {
            DataType::Byte => out[0] = v.round().clamp(0.0, u8::MAX as f64) as u8,
            DataType::UInt16 => out.copy_from_slice(
                &(v.round().clamp(0.0, u16::MAX as f64) as u16).to_ne_bytes(),
            ),
            DataType::Int16 => out.copy_from_slice(
                &(v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16).to_ne_bytes(),
            ),
            DataType::UInt32 => out.copy_from_slice(
                &(v.round().clamp(0.0, u32::MAX as f64) as u32).to_ne_bytes(),
            ),
            DataType::Int32 => out.copy_from_slice(
                &(v.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32).to_ne_bytes(),
            ),
            DataType::Float32 => out.copy_from_slice(&(v as f32).to_ne_bytes()),
            DataType::Float64 => out.copy_from_slice(&v.to_ne_bytes()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compression {
    None,
    #[default]
    Deflate,
    Png,
    Jpeg,
    Tif,
    Lerc,
}

impl Compression {
    /// 数据文件默认扩展名
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "til",
            Compression::Deflate => "pzp",
            Compression::Png => "ppg",
            Compression::Jpeg => "pjg",
            Compression::Tif => "ptf",
            Compression::Lerc => "lrc",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Interleave {
    /// 页内像素交错（所有波段在同一页）
    Pixel,
    /// 页内按波段分块，或每个波段组单独成页
    Band,
}

/// 单个层级的影像描述
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    /// 像素尺寸，`l` 为层级号
    pub size: Size,
    /// 页（瓦片）尺寸，z 恒为 1
    pub page_size: Size,
    /// 各轴页数，`l` 为本层总页数
    pub page_count: Size,
    pub data_type: DataType,
    pub compression: Compression,
    pub order: Interleave,
    pub net_byte_order: bool,
    pub quality: u8,
    pub page_size_bytes: u64,
    /// 本层索引区在索引文件中的起始字节
    pub idx_offset: u64,
}

impl Image {
    pub fn new(
        size: Size,
        page_size: Size,
        data_type: DataType,
        compression: Compression,
        order: Interleave,
    ) -> Self {
        let page_size = Size {
            z: 1,
            l: 0,
            ..page_size
        };
        let page_count = page_count(&size, &page_size);
        let page_size_bytes =
            data_type.size_bytes() as u64 * page_size.x * page_size.y * page_size.c;
        Self {
            size,
            page_size,
            page_count,
            data_type,
            compression,
            order,
            net_byte_order: false,
            quality: 85,
            page_size_bytes,
            idx_offset: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.size.l as usize
    }

    /// 本层索引区字节长度（含所有 z 切片与波段组）
    pub fn index_length(&self) -> u64 {
        self.page_count.l * IDX_RECORD
    }

    /// 单个 z 切片占用的索引记录数
    pub fn records_per_slice(&self) -> u64 {
        self.page_count.l / self.size.z.max(1)
    }

    pub fn is_single_tile(&self) -> bool {
        self.page_count.x * self.page_count.y == 1
    }

    /// 下一层：x/y 按 scale 向上取整缩小，索引区紧接本层之后
    pub fn next_level(&self, scale: u64) -> Image {
        let size = Size {
            x: pcount(self.size.x, scale),
            y: pcount(self.size.y, scale),
            l: self.size.l + 1,
            ..self.size
        };
        Image {
            size,
            page_count: page_count(&size, &self.page_size),
            idx_offset: self.idx_offset + self.index_length(),
            ..self.clone()
        }
    }

    /// 页内样本下标
    pub fn sample_index(&self, col: u64, row: u64, band: u64) -> usize {
        let (px, py, pc) = (self.page_size.x, self.page_size.y, self.page_size.c);
        let i = match self.order {
            Interleave::Pixel => (row * px + col) * pc + band,
            Interleave::Band => band * px * py + row * px + col,
        };
        i as usize
    }
}

/// 瓦片坐标：(level, z 切片, 波段组, 行, 列)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub level: usize,
    pub z: u64,
    pub band: u64,
    pub y: u64,
    pub x: u64,
}

impl TileCoord {
    pub fn new(level: usize, x: u64, y: u64) -> Self {
        Self {
            level,
            z: 0,
            band: 0,
            y,
            x,
        }
    }

    pub fn with_band(mut self, band: u64) -> Self {
        self.band = band;
        self
    }

    pub fn with_slice(mut self, z: u64) -> Self {
        self.z = z;
        self
    }
}
