use crate::core::error::{MrfError, Result};
use crate::core::geometry::{Image, TileCoord};
use crate::index::entry::IDX_RECORD;

/// 瓦片索引记录在索引文件中的字节偏移
///
/// 记录按 (z, 行, 列, 波段组) 排列，波段组变化最快：
/// `idx_offset + 16 * (z * records_per_slice + (y * pages_x + x) * pages_c + band)`
pub fn index_offset(img: &Image, coord: &TileCoord) -> Result<u64> {
    check_coord(img, coord)?;
    let pc = &img.page_count;
    let in_slice = (coord.y * pc.x + coord.x) * pc.c + coord.band;
    let record = coord.z * img.records_per_slice() + in_slice;
    Ok(img.idx_offset + record * IDX_RECORD)
}

fn check_coord(img: &Image, coord: &TileCoord) -> Result<()> {
    let pc = &img.page_count;
    let reason = if coord.level != img.level() {
        Some(format!("level {} requested from level {}", coord.level, img.level()))
    } else if coord.x >= pc.x || coord.y >= pc.y {
        Some(format!("grid is {}x{} pages", pc.x, pc.y))
    } else if coord.band >= pc.c {
        Some(format!("{} band groups", pc.c))
    } else if coord.z >= img.size.z {
        Some(format!("{} z slices", img.size.z))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(MrfError::InvalidTile {
            coord: *coord,
            reason,
        }),
        None => Ok(()),
    }
}

/// 整个金字塔（从 base 到 1x1 页）的索引字节长度
pub fn pyramid_index_length(base: &Image, scale: u64) -> Result<u64> {
    if scale <= 1 {
        return Err(MrfError::config(format!(
            "scale factor {} would never converge",
            scale
        )));
    }
    let mut img = base.clone();
    let mut total = img.index_length();
    while !img.is_single_tile() {
        img = img.next_level(scale);
        total += img.index_length();
    }
    Ok(total)
}
