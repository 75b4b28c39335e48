use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::core::error::{MrfError, Result};
use crate::core::geometry::{Compression, Image};

/// 瓦片编解码接口：原始页像素 <-> 数据文件中的字节
///
/// 页像素为主机字节序，长度恒为 `page_size_bytes`。
pub trait TileCodec: Send + Sync {
    fn compress(&self, img: &Image, raw: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, img: &Image, encoded: &[u8]) -> Result<Vec<u8>>;
}

/// 按压缩方式选择编解码器
pub fn codec_for(img: &Image) -> Result<Box<dyn TileCodec>> {
    match img.compression {
        Compression::None => Ok(Box::new(RawCodec)),
        Compression::Deflate => Ok(Box::new(DeflateCodec)),
        other => Err(MrfError::Unsupported(format!(
            "{:?} tiles have no built-in codec",
            other
        ))),
    }
}

fn check_page_len(img: &Image, len: usize) -> Result<()> {
    if len as u64 != img.page_size_bytes {
        return Err(MrfError::Codec(format!(
            "page is {} bytes, expected {}",
            len, img.page_size_bytes
        )));
    }
    Ok(())
}

// 网络字节序存储的多字节类型需要在小端主机上逐样本翻转
fn swap_if_needed(img: &Image, buf: &mut [u8]) {
    let n = img.data_type.size_bytes();
    if !img.net_byte_order || n == 1 || cfg!(target_endian = "big") {
        return;
    }
    for sample in buf.chunks_exact_mut(n) {
        sample.reverse();
    }
}

/// 不压缩
pub struct RawCodec;

impl TileCodec for RawCodec {
    fn compress(&self, img: &Image, raw: &[u8]) -> Result<Vec<u8>> {
        check_page_len(img, raw.len())?;
        let mut out = raw.to_vec();
        swap_if_needed(img, &mut out);
        Ok(out)
    }

    fn decompress(&self, img: &Image, encoded: &[u8]) -> Result<Vec<u8>> {
        check_page_len(img, encoded.len())?;
        let mut out = encoded.to_vec();
        swap_if_needed(img, &mut out);
        Ok(out)
    }
}

/// zlib 流；压缩级别取 quality / 10
pub struct DeflateCodec;

impl DeflateCodec {
    fn level(img: &Image) -> flate2::Compression {
        flate2::Compression::new((img.quality as u32 / 10).min(9))
    }
}

impl TileCodec for DeflateCodec {
    fn compress(&self, img: &Image, raw: &[u8]) -> Result<Vec<u8>> {
        check_page_len(img, raw.len())?;
        let mut page = raw.to_vec();
        swap_if_needed(img, &mut page);
        let mut encoder = ZlibEncoder::new(Vec::new(), Self::level(img));
        encoder
            .write_all(&page)
            .map_err(|err| MrfError::Codec(format!("Could not deflate tile: {err}")))?;
        encoder
            .finish()
            .map_err(|err| MrfError::Codec(format!("Could not finish deflate stream: {err}")))
    }

    fn decompress(&self, img: &Image, encoded: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(encoded);
        let mut out = Vec::with_capacity(img.page_size_bytes as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|err| MrfError::Codec(format!("Could not inflate tile: {err}")))?;
        check_page_len(img, out.len())?;
        swap_if_needed(img, &mut out);
        Ok(out)
    }
}
