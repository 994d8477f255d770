//! Basic data types shared by the holdnode crates.
//!
//! This crate must stay a leaf: plain data, codecs for the on-disk meta
//! sidecar, error codes and configuration structs. No I/O.

mod ids;
mod meta;

pub mod config;
pub mod error;

pub use ids::{BlockId, CellGuid, ChunkId};
pub use meta::{
    BlockSizesExt, ChunkMeta, MetaExtension, PartitionSlice, PartitionsExt,
    BLOCK_SIZES_EXT_TAG, LEGACY_BLOCK_SIZES_EXT_TAG, PARTITIONS_EXT_TAG,
};

use serde::{Deserialize, Serialize};

/// Suffix of the meta sidecar file next to each chunk data file.
pub const CHUNK_META_SUFFIX: &str = ".meta";

/// `ChunkMeta::chunk_type` of blob chunks.
pub const CHUNK_TYPE_BLOB: i32 = 1;

/// `ChunkMeta::chunk_type` of append-only journal chunks.
pub const CHUNK_TYPE_JOURNAL: i32 = 2;

/// Name of the optional cell guid tag file at a location root.
pub const CELL_GUID_FILE_NAME: &str = "cell_guid";

/// Result of scanning one chunk off a location directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    /// Data file plus meta file, in bytes.
    pub disk_size: u64,
}

/// Summary info of a complete chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub size: u64,
    /// Journal chunks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub sealed: bool,
}

impl ChunkInfo {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            record_count: None,
            sealed: false,
        }
    }
}
