#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod codec;
pub mod core;
pub mod dataset;
pub mod index;
pub mod overview;
pub mod stats;
pub mod storage;

pub use crate::core::{DatasetConfig, MrfError, Result, TileCoord};
pub use crate::dataset::{MrfDataset, OpenOptions};
