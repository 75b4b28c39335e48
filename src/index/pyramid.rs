use crate::core::error::{MrfError, Result};
use crate::core::geometry::Image;

/// 金字塔层级表：level 0 为全分辨率，索引区按层级升序、首尾相接
#[derive(Clone, Debug)]
pub struct Pyramid {
    levels: Vec<Image>,
    scale: Option<u64>,
}

impl Pyramid {
    pub fn new(base: Image) -> Self {
        Self {
            levels: vec![base],
            scale: None,
        }
    }

    pub fn levels(&self) -> &[Image] {
        &self.levels
    }

    pub fn level(&self, l: usize) -> Option<&Image> {
        self.levels.get(l)
    }

    pub fn base(&self) -> &Image {
        &self.levels[0]
    }

    pub fn scale(&self) -> Option<u64> {
        self.scale
    }

    pub fn overview_count(&self) -> usize {
        self.levels.len() - 1
    }

    /// 所有层级索引区总长（单个版本、不含克隆区）
    pub fn index_length(&self) -> u64 {
        let last = &self.levels[self.levels.len() - 1];
        last.idx_offset + last.index_length()
    }

    /// 按统一缩放系数补齐概览层，直到单页为止；返回整个金字塔的索引长度
    ///
    /// 已存在的层级不会重复登记，重复调用只返回相同长度。
    pub fn add_overviews(&mut self, scale: u64) -> Result<u64> {
        if scale <= 1 {
            return Err(MrfError::config(format!(
                "scale factor {} would never converge",
                scale
            )));
        }
        match self.scale {
            Some(s) if s != scale && self.overview_count() > 0 => {
                return Err(MrfError::config(format!(
                    "pyramid already built with scale {}, can't add scale {}",
                    s, scale
                )));
            }
            _ => {}
        }
        self.scale = Some(scale);

        loop {
            let top = &self.levels[self.levels.len() - 1];
            if top.is_single_tile() {
                break;
            }
            let next = top.next_level(scale);
            tracing::debug!(
                "Registered level {}: {}x{} px, {} pages at index offset {}",
                next.level(),
                next.size.x,
                next.size.y,
                next.page_count.l,
                next.idx_offset
            );
            self.levels.push(next);
        }
        Ok(self.index_length())
    }

    /// 删除所有概览层；返回被释放的索引字节区间 `[start, end)`
    pub fn clear_overviews(&mut self) -> Option<(u64, u64)> {
        if self.levels.len() < 2 {
            self.scale = None;
            return None;
        }
        let end = self.index_length();
        self.levels.truncate(1);
        self.scale = None;
        Some((self.index_length(), end))
    }
}
