use std::collections::HashMap;

use crate::core::error::{MrfError, Result};
use crate::core::geometry::{Image, TileCoord};

/// 概览层重采样方式
#[derive(Clone, Copy)]
pub enum Resampling<'a> {
    /// 块平均（只统计存在的源像素）
    Average,
    /// 取块左上角像素
    Nearest,
    /// 交给外部实现，核心负责读源页、编码和写回
    External(&'a dyn OverviewRegenerator),
}

impl std::fmt::Debug for Resampling<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resampling::Average => f.write_str("Average"),
            Resampling::Nearest => f.write_str("Nearest"),
            Resampling::External(_) => f.write_str("External"),
        }
    }
}

impl Resampling<'static> {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "avg" | "average" => Ok(Resampling::Average),
            "near" | "nearest" => Ok(Resampling::Nearest),
            other => Err(MrfError::Unsupported(format!(
                "resampling '{}' has no built-in implementation",
                other
            ))),
        }
    }
}

impl<'a> Resampling<'a> {
    pub fn regenerator(&self) -> &'a dyn OverviewRegenerator {
        match *self {
            Resampling::Average => &BlockSampler::AVERAGE,
            Resampling::Nearest => &BlockSampler::NEAREST,
            Resampling::External(r) => r,
        }
    }
}

/// 生成一个目标页所需的全部输入
pub struct RegenJob<'a> {
    pub source: &'a Image,
    pub target: &'a Image,
    pub coord: TileCoord,
    pub scale: u64,
    /// 已解码的源页，按源层 (x, y) 页坐标索引；缺失的页不在表中
    pub sources: HashMap<(u64, u64), Vec<u8>>,
}

impl RegenJob<'_> {
    /// 源层像素 `(px, py)` 第 `band` 个页内波段的样本；越界或页缺失时为 None
    pub fn sample(&self, px: u64, py: u64, band: u64) -> Option<f64> {
        let src = self.source;
        if px >= src.size.x || py >= src.size.y {
            return None;
        }
        let (tx, ty) = (px / src.page_size.x, py / src.page_size.y);
        let page = self.sources.get(&(tx, ty))?;
        let i = src.sample_index(px % src.page_size.x, py % src.page_size.y, band);
        Some(src.data_type.read_sample(page, i))
    }
}

/// 外部概览生成实现：返回目标页的原始像素（主机字节序，长度为一页）
pub trait OverviewRegenerator: Send + Sync {
    fn regenerate(&self, job: &RegenJob<'_>) -> Result<Vec<u8>>;
}

/// 目标页覆盖的源层页坐标
pub fn source_tiles(source: &Image, target: &Image, coord: &TileCoord, scale: u64) -> Vec<TileCoord> {
    let (px, py) = (target.page_size.x, target.page_size.y);
    let gx0 = coord.x * px;
    let gy0 = coord.y * py;
    let gx1 = (gx0 + px).min(target.size.x);
    let gy1 = (gy0 + py).min(target.size.y);
    if gx0 >= gx1 || gy0 >= gy1 {
        return Vec::new();
    }
    let sx1 = (gx1 * scale).min(source.size.x);
    let sy1 = (gy1 * scale).min(source.size.y);
    let mut out = Vec::new();
    for ty in (gy0 * scale) / source.page_size.y..=(sy1 - 1) / source.page_size.y {
        for tx in (gx0 * scale) / source.page_size.x..=(sx1 - 1) / source.page_size.x {
            out.push(TileCoord {
                level: source.level(),
                z: coord.z,
                band: coord.band,
                y: ty,
                x: tx,
            });
        }
    }
    out
}

/// 内置盒式滤波
#[derive(Clone, Copy, Debug)]
pub struct BlockSampler {
    nearest: bool,
}

impl BlockSampler {
    pub const AVERAGE: BlockSampler = BlockSampler { nearest: false };
    pub const NEAREST: BlockSampler = BlockSampler { nearest: true };
}

impl OverviewRegenerator for BlockSampler {
    fn regenerate(&self, job: &RegenJob<'_>) -> Result<Vec<u8>> {
        let t = job.target;
        let mut out = vec![0u8; t.page_size_bytes as usize];
        let scale = job.scale;
        let src_size = &job.source.size;

        for row in 0..t.page_size.y {
            let gy = job.coord.y * t.page_size.y + row;
            if gy >= t.size.y {
                break;
            }
            for col in 0..t.page_size.x {
                let gx = job.coord.x * t.page_size.x + col;
                if gx >= t.size.x {
                    break;
                }
                let (sx0, sy0) = (gx * scale, gy * scale);
                let sx1 = ((gx + 1) * scale).min(src_size.x);
                let sy1 = ((gy + 1) * scale).min(src_size.y);

                for band in 0..t.page_size.c {
                    let value = if self.nearest {
                        job.sample(sx0, sy0, band)
                    } else {
                        let mut sum = 0.0;
                        let mut count = 0u32;
                        for sy in sy0..sy1 {
                            for sx in sx0..sx1 {
                                if let Some(v) = job.sample(sx, sy, band) {
                                    sum += v;
                                    count += 1;
                                }
                            }
                        }
                        (count > 0).then(|| sum / count as f64)
                    };
                    if let Some(v) = value {
                        t.data_type
                            .write_sample(&mut out, t.sample_index(col, row, band), v);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Compression, DataType, Interleave, Size};

    fn level0() -> Image {
        Image::new(
            Size::new(8, 8, 1, 1),
            Size::new(4, 4, 1, 1),
            DataType::Byte,
            Compression::None,
            Interleave::Pixel,
        )
    }

    fn job<'a>(src: &'a Image, dst: &'a Image, pages: &[((u64, u64), u8)]) -> RegenJob<'a> {
        RegenJob {
            source: src,
            target: dst,
            coord: TileCoord::new(1, 0, 0),
            scale: 2,
            sources: pages
                .iter()
                .map(|(k, v)| (*k, vec![*v; 16]))
                .collect(),
        }
    }

    #[test]
    fn source_tiles_cover_the_block() {
        let src = level0();
        let dst = src.next_level(2);
        let tiles = source_tiles(&src, &dst, &TileCoord::new(1, 0, 0), 2);
        let xy: Vec<(u64, u64)> = tiles.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(xy, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert!(tiles.iter().all(|t| t.level == 0));
    }

    #[test]
    fn average_ignores_missing_pages() {
        let src = level0();
        let dst = src.next_level(2);
        let j = job(&src, &dst, &[((0, 0), 10), ((1, 0), 30)]);
        let out = BlockSampler::AVERAGE.regenerate(&j).unwrap();
        // 目标页 4x4 中，上半部分来自源页 (0,0)/(1,0)，下半部分没有源
        assert_eq!(out[0], 10);
        assert_eq!(out[3], 30);
        assert_eq!(out[12], 0);
    }

    #[test]
    fn nearest_takes_top_left() {
        let src = level0();
        let dst = src.next_level(2);
        let mut j = job(&src, &dst, &[((0, 0), 0)]);
        if let Some(p) = j.sources.get_mut(&(0, 0)) {
            p[1] = 200;
            p[0] = 50;
        }
        let out = BlockSampler::NEAREST.regenerate(&j).unwrap();
        assert_eq!(out[0], 50);
        let avg = BlockSampler::AVERAGE.regenerate(&j).unwrap();
        assert_eq!(avg[0], 63);
    }

    #[test]
    fn parse_names() {
        assert!(matches!(Resampling::parse("AVG"), Ok(Resampling::Average)));
        assert!(matches!(Resampling::parse("nearest"), Ok(Resampling::Nearest)));
        assert!(Resampling::parse("cubic").is_err());
    }
}
