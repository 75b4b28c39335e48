pub mod clone;
pub mod files;
pub mod version;
pub mod writer;

pub use clone::{CloneCounters, CloneStats, CLONE_BLOCK};
pub use files::{Access, DataFile, FileMode, IndexFile, WaitPolicy};
pub use version::VersionLog;
pub use writer::{write_tile, DataSink, TilePayload, WriteContext, WriteOutcome};
