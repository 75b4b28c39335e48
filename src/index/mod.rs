pub mod entry;
pub mod offset;
pub mod pyramid;

pub use entry::{TileIdx, CHECKED, CHECKED_MARKER, IDX_RECORD};
pub use offset::{index_offset, pyramid_index_length};
pub use pyramid::Pyramid;
