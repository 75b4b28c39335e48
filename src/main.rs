use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mrf_store::core::{
    CachedSourceConfig, Compression, DataType, DatasetConfig, Dims, PageDims, RsetsConfig,
};
use mrf_store::overview::Resampling;
use mrf_store::storage::WriteOutcome;
use mrf_store::{MrfDataset, OpenOptions, TileCoord};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mrf", version, about = "Tiled raster index/data file tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 写描述文件并创建空的索引/数据文件
    Init {
        descriptor: PathBuf,
        #[arg(long)]
        width: u64,
        #[arg(long)]
        height: u64,
        #[arg(long, default_value_t = 1)]
        bands: u64,
        #[arg(long, default_value_t = 512)]
        page: u64,
        /// none | deflate
        #[arg(long, default_value = "deflate")]
        compression: String,
        /// byte | uint16 | int16 | uint32 | int32 | float32 | float64
        #[arg(long, default_value = "byte")]
        data_type: String,
        #[arg(long)]
        versioned: bool,
        #[arg(long)]
        mp_safe: bool,
        /// 预先登记概览层的缩放系数
        #[arg(long)]
        scale: Option<u64>,
        /// 作为缓存打开时的源描述文件
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long, requires = "source")]
        clone: bool,
    },
    /// 打印数据集概况
    Info {
        descriptor: PathBuf,
        #[arg(long)]
        json: bool,
        /// 查看历史版本
        #[arg(long)]
        version: Option<u64>,
    },
    /// 把一页原始像素写入瓦片
    Put {
        descriptor: PathBuf,
        #[arg(long)]
        x: u64,
        #[arg(long)]
        y: u64,
        #[arg(long, default_value_t = 0)]
        level: usize,
        #[arg(long, default_value_t = 0)]
        band: u64,
        #[arg(long, default_value_t = 0)]
        z: u64,
        /// 原始像素文件（主机字节序，一整页）
        input: PathBuf,
    },
    /// 读出一页原始像素
    Get {
        descriptor: PathBuf,
        #[arg(long)]
        x: u64,
        #[arg(long)]
        y: u64,
        #[arg(long, default_value_t = 0)]
        level: usize,
        #[arg(long, default_value_t = 0)]
        band: u64,
        #[arg(long, default_value_t = 0)]
        z: u64,
        #[arg(long)]
        version: Option<u64>,
        output: PathBuf,
    },
    /// 擦除一个瓦片
    Erase {
        descriptor: PathBuf,
        #[arg(long)]
        x: u64,
        #[arg(long)]
        y: u64,
        #[arg(long, default_value_t = 0)]
        level: usize,
        #[arg(long, default_value_t = 0)]
        band: u64,
        #[arg(long, default_value_t = 0)]
        z: u64,
    },
    /// 生成概览层
    Overviews {
        descriptor: PathBuf,
        #[arg(long, value_delimiter = ',', default_value = "2,4,8,16")]
        factors: Vec<u64>,
        /// avg | near
        #[arg(long, default_value = "avg")]
        resampling: String,
        /// 删除已有概览层
        #[arg(long, conflicts_with = "factors")]
        clean: bool,
    },
}

fn parse_compression(s: &str) -> anyhow::Result<Compression> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "none" => Compression::None,
        "deflate" | "zlib" => Compression::Deflate,
        "png" => Compression::Png,
        "jpeg" | "jpg" => Compression::Jpeg,
        other => anyhow::bail!("unknown compression {}", other),
    })
}

fn parse_data_type(s: &str) -> anyhow::Result<DataType> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "byte" => DataType::Byte,
        "uint16" => DataType::UInt16,
        "int16" => DataType::Int16,
        "uint32" => DataType::UInt32,
        "int32" => DataType::Int32,
        "float32" => DataType::Float32,
        "float64" => DataType::Float64,
        other => anyhow::bail!("unknown data type {}", other),
    })
}

fn coord(level: usize, x: u64, y: u64, band: u64, z: u64) -> TileCoord {
    TileCoord::new(level, x, y).with_band(band).with_slice(z)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init {
            descriptor,
            width,
            height,
            bands,
            page,
            compression,
            data_type,
            versioned,
            mp_safe,
            scale,
            source,
            clone,
        } => {
            let mut cfg = DatasetConfig::new(width, height);
            cfg.raster.size = Dims {
                x: width,
                y: height,
                z: 1,
                c: bands,
            };
            cfg.raster.page_size = Some(PageDims {
                x: page,
                y: page,
                c: None,
            });
            cfg.raster.compression = parse_compression(&compression)?;
            cfg.raster.data_type = parse_data_type(&data_type)?;
            cfg.raster.versioned = versioned;
            cfg.raster.mp_safe = mp_safe;
            cfg.rsets = scale.map(RsetsConfig::uniform);
            cfg.cached_source = source.map(|source| CachedSourceConfig { source, clone });

            let ds = MrfDataset::create(&descriptor, cfg, OpenOptions::update())
                .with_context(|| format!("creating {}", descriptor.display()))?;
            info!(
                "Initialized {}: {} levels, index {} bytes",
                descriptor.display(),
                ds.levels().len(),
                ds.idx_size()
            );
        }

        Command::Info {
            descriptor,
            json,
            version,
        } => {
            let mut opts = OpenOptions::read_only();
            opts.version = version;
            let ds = MrfDataset::open(&descriptor, opts)?;
            let report = ds.report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }

        Command::Put {
            descriptor,
            x,
            y,
            level,
            band,
            z,
            input,
        } => {
            let raw = std::fs::read(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let ds = MrfDataset::open(&descriptor, OpenOptions::update())?;
            let c = coord(level, x, y, band, z);
            match ds.write_page(&c, &raw)? {
                WriteOutcome::Unchanged => info!("Tile {:?} unchanged", c),
                WriteOutcome::Written {
                    entry,
                    versioned,
                    attempts,
                } => info!(
                    "Tile {:?} written at {} ({} bytes, {} attempts{})",
                    c,
                    entry.offset,
                    entry.size,
                    attempts,
                    if versioned { ", new version" } else { "" }
                ),
            }
        }

        Command::Get {
            descriptor,
            x,
            y,
            level,
            band,
            z,
            version,
            output,
        } => {
            let mut opts = OpenOptions::read_only();
            opts.version = version;
            let ds = MrfDataset::open(&descriptor, opts)?;
            let c = coord(level, x, y, band, z);
            match ds.read_page(&c)? {
                Some(page) => {
                    std::fs::write(&output, &page)
                        .with_context(|| format!("writing {}", output.display()))?;
                    info!("Tile {:?}: {} bytes to {}", c, page.len(), output.display());
                }
                None => anyhow::bail!("tile {:?} is absent", c),
            }
        }

        Command::Erase {
            descriptor,
            x,
            y,
            level,
            band,
            z,
        } => {
            let ds = MrfDataset::open(&descriptor, OpenOptions::update())?;
            let c = coord(level, x, y, band, z);
            let outcome = ds.erase_tile(&c)?;
            info!("Erase {:?}: {:?}", c, outcome);
        }

        Command::Overviews {
            descriptor,
            factors,
            resampling,
            clean,
        } => {
            let mut ds = MrfDataset::open(&descriptor, OpenOptions::update())?;
            if clean {
                ds.clean_overviews()?;
                info!("Removed overviews from {}", descriptor.display());
            } else {
                let resampling = Resampling::parse(&resampling)?;
                let built = ds.build_overviews(&factors, &resampling)?;
                info!("Built overview levels {:?}", built);
            }
        }
    }

    Ok(())
}
