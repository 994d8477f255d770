//! Opaque RPC stubs. The wire transport, dispatch and authentication live
//! elsewhere; these traits are the exact requests the write engines issue.

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;

use hold_api_types::{ChunkId, ChunkInfo, ChunkMeta};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeDescriptor {
    pub address: String,
}

impl NodeDescriptor {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl std::fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// Write-path verbs of one data node.
#[async_trait]
pub trait DataNodeClient: Send + Sync {
    async fn start_chunk(&self, chunk_id: ChunkId) -> Result<(), Error>;

    async fn put_blocks(
        &self,
        chunk_id: ChunkId,
        first_block_index: u32,
        blocks: Vec<Bytes>,
        flush_blocks: bool,
    ) -> Result<(), Error>;

    async fn finish_chunk(
        &self,
        chunk_id: ChunkId,
        meta: ChunkMeta,
        written_block_count: u32,
    ) -> Result<ChunkInfo, Error>;

    async fn ping_session(&self, chunk_id: ChunkId) -> Result<(), Error>;
}

/// Hands out (usually pooled) node channels by address.
pub trait DataNodeChannelFactory: Send + Sync {
    fn create_channel(&self, address: &str) -> std::sync::Arc<dyn DataNodeClient>;
}

/// Reply to a journal chunk creation: the new chunk object and the write
/// targets chosen by the master.
#[derive(Clone, Debug)]
pub struct CreatedChunk {
    pub chunk_id: ChunkId,
    pub targets: Vec<NodeDescriptor>,
}

/// Master verbs used by the journal writer.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Create a journal chunk object (erasure none, the given replication)
    /// and allocate its write targets, excluding the listed addresses.
    async fn create_journal_chunk(
        &self,
        replication_factor: usize,
        forbidden_addresses: &[String],
        prefer_local_host: bool,
    ) -> Result<CreatedChunk, Error>;

    /// Batch: confirm the chunk object with its replicas and attach the
    /// chunk to the journal's chunk list. Both must succeed.
    async fn confirm_and_attach(
        &self,
        journal_path: &str,
        chunk_id: ChunkId,
        replicas: &[NodeDescriptor],
    ) -> Result<(), Error>;

    /// Fix the final record count of a journal chunk.
    async fn seal_chunk(&self, chunk_id: ChunkId, record_count: u64) -> Result<(), Error>;
}
