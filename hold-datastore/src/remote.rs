//! Seams towards other data nodes. The wire transport lives outside this
//! crate; these traits are what the storage core needs from it.

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;

use hold_api_types::{ChunkId, ChunkMeta};

/// Metadata-aware reader of a remote chunk, used by the chunk cache to
/// materialize chunks locally.
#[async_trait]
pub trait RemoteChunkReader: Send + Sync {
    async fn fetch_meta(&self, chunk_id: ChunkId) -> Result<ChunkMeta, Error>;

    async fn read_block(&self, chunk_id: ChunkId, block_index: u32) -> Result<Bytes, Error>;
}

/// Pushes a range of session window blocks to another data node during
/// upload fan-out.
#[async_trait]
pub trait BlockReplicator: Send + Sync {
    async fn replicate_blocks(
        &self,
        target_address: &str,
        chunk_id: ChunkId,
        first_block_index: u32,
        blocks: Vec<Bytes>,
    ) -> Result<(), Error>;
}
