//! The data node verb surface.
//!
//! An RPC transport deserializes requests into the structs here and calls
//! the matching handler; bulk block payloads travel as attachments and show
//! up as `Bytes`. The service enforces the read/write throttle gates at this
//! boundary - the core paths below never reject on throttle themselves.

pub mod peer_updater;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Error};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};

use hold_api_types::error::{has_code, node_error, ErrorCode, NodeError};
use hold_api_types::{
    BlockId, ChunkId, ChunkInfo, ChunkMeta, PartitionsExt, PARTITIONS_EXT_TAG,
};
use hold_datastore::{PeerInfo, Session};

use crate::node::DataNode;

/// A peer as described on the wire: its address and how long the
/// association should be kept.
#[derive(Clone, Debug)]
pub struct PeerDescriptor {
    pub address: String,
    pub expires_at: Instant,
}

pub struct StartChunkRequest {
    pub chunk_id: ChunkId,
}

pub struct FinishChunkRequest {
    pub chunk_id: ChunkId,
    pub meta: ChunkMeta,
    pub written_block_count: u32,
}

#[derive(Debug)]
pub struct FinishChunkResponse {
    pub chunk_info: ChunkInfo,
}

pub struct PutBlocksRequest {
    pub chunk_id: ChunkId,
    pub first_block_index: u32,
    pub blocks: Vec<Bytes>,
    pub enable_caching: bool,
    /// Flush up to the last block of this request before replying; used by
    /// journal writers for per-batch acknowledgement.
    pub flush_blocks: bool,
}

pub struct SendBlocksRequest {
    pub chunk_id: ChunkId,
    pub first_block_index: u32,
    pub block_count: u32,
    pub target_address: String,
}

pub struct FlushBlockRequest {
    pub chunk_id: ChunkId,
    pub block_index: u32,
}

pub struct PingSessionRequest {
    pub chunk_id: ChunkId,
}

pub struct GetBlocksRequest {
    pub chunk_id: ChunkId,
    pub block_indexes: Vec<u32>,
    pub enable_caching: bool,
    /// The caller announcing itself as a future peer for the served blocks.
    pub peer: Option<PeerDescriptor>,
}

#[derive(Debug, Default)]
pub struct BlockInfo {
    pub data_attached: bool,
    pub data: Option<Bytes>,
    pub peer_addresses: Vec<String>,
}

#[derive(Debug)]
pub struct GetBlocksResponse {
    pub has_complete_chunk: bool,
    pub blocks: Vec<BlockInfo>,
}

pub struct GetChunkMetaRequest {
    pub chunk_id: ChunkId,
    pub all_extension_tags: bool,
    pub extension_tags: Vec<i32>,
    pub partition_tag: Option<i32>,
}

#[derive(Debug)]
pub struct GetChunkMetaResponse {
    pub meta: ChunkMeta,
}

pub struct PrecacheChunkRequest {
    pub chunk_id: ChunkId,
}

pub struct UpdatePeerRequest {
    pub peer: PeerDescriptor,
    pub block_ids: Vec<BlockId>,
}

pub struct DataNodeService {
    node: Arc<DataNode>,
    /// Reported by the transport: reply bytes accepted but not yet on the
    /// wire. Feeds the read throttle together with the pending disk reads.
    pending_network_out: AtomicI64,
}

impl DataNodeService {
    pub fn new(node: Arc<DataNode>) -> Arc<Self> {
        Arc::new(Self {
            node,
            pending_network_out: AtomicI64::new(0),
        })
    }

    pub fn node(&self) -> &Arc<DataNode> {
        &self.node
    }

    pub fn update_pending_network_out(&self, delta: i64) {
        self.pending_network_out.fetch_add(delta, Ordering::SeqCst);
    }

    fn pending_read_size(&self) -> i64 {
        self.pending_network_out.load(Ordering::SeqCst)
            + self.node.block_store().pending_read_size()
    }

    fn is_read_throttling(&self) -> bool {
        let pending = self.pending_read_size();
        if pending > self.node.config().read_throttling_size as i64 {
            log::debug!(
                "read throttling is active: {} > {}",
                pending,
                self.node.config().read_throttling_size
            );
            true
        } else {
            false
        }
    }

    fn is_write_throttling(&self) -> bool {
        let pending = self.node.session_manager().pending_write_size();
        if pending > self.node.config().write_throttling_size as i64 {
            log::debug!(
                "write throttling is active: {} > {}",
                pending,
                self.node.config().write_throttling_size
            );
            true
        } else {
            false
        }
    }

    fn get_session(&self, chunk_id: ChunkId) -> Result<Arc<Session>, Error> {
        self.node
            .session_manager()
            .find_session(chunk_id)
            .ok_or_else(|| {
                node_error(
                    ErrorCode::NoSuchSession,
                    format!("session is invalid or expired: {}", chunk_id),
                )
            })
    }

    pub async fn start_chunk(&self, request: StartChunkRequest) -> Result<(), Error> {
        let chunk_id = request.chunk_id;

        if self.node.session_manager().find_session(chunk_id).is_some() {
            return Err(node_error(
                ErrorCode::SessionAlreadyExists,
                format!("session already exists: {}", chunk_id),
            ));
        }
        if self.node.chunk_store().find_chunk(chunk_id).is_some() {
            return Err(node_error(
                ErrorCode::ChunkAlreadyExists,
                format!("chunk already exists: {}", chunk_id),
            ));
        }

        self.node.session_manager().start_session(chunk_id).await?;
        Ok(())
    }

    pub async fn finish_chunk(
        &self,
        request: FinishChunkRequest,
    ) -> Result<FinishChunkResponse, Error> {
        let session = self.get_session(request.chunk_id)?;

        let written = session.written_block_count();
        if written != request.written_block_count {
            return Err(node_error(
                ErrorCode::WindowError,
                format!(
                    "written block count mismatch: client sent {}, session wrote {}",
                    request.written_block_count, written
                ),
            ));
        }

        let chunk = self
            .node
            .session_manager()
            .finish_session(&session, &request.meta)
            .await?;
        Ok(FinishChunkResponse {
            chunk_info: chunk.info(),
        })
    }

    pub async fn put_blocks(&self, request: PutBlocksRequest) -> Result<(), Error> {
        if self.is_write_throttling() {
            return Err(node_error(
                ErrorCode::Unavailable,
                "write throttling is active",
            ));
        }

        let session = self.get_session(request.chunk_id)?;
        let block_count = request.blocks.len() as u32;

        let mut block_index = request.first_block_index;
        for block in request.blocks {
            session
                .put_block(block_index, block, request.enable_caching)
                .await?;
            block_index += 1;
        }

        if request.flush_blocks && block_count > 0 {
            session
                .flush_block(request.first_block_index + block_count - 1)
                .await?;
        }
        Ok(())
    }

    pub async fn send_blocks(&self, request: SendBlocksRequest) -> Result<(), Error> {
        let session = self.get_session(request.chunk_id)?;
        session
            .send_blocks(
                request.first_block_index,
                request.block_count,
                &request.target_address,
            )
            .await
            .map_err(|err| {
                // window problems are the caller's fault, keep their code
                if has_code(&err, ErrorCode::WindowError) {
                    err
                } else {
                    err.context(NodeError::new(
                        ErrorCode::RemoteCallFailed,
                        format!("error putting blocks to {}", request.target_address),
                    ))
                }
            })
    }

    pub async fn flush_block(&self, request: FlushBlockRequest) -> Result<(), Error> {
        let session = self.get_session(request.chunk_id)?;
        session.flush_block(request.block_index).await
    }

    pub async fn ping_session(&self, request: PingSessionRequest) -> Result<(), Error> {
        // the lookup itself renews the lease
        self.get_session(request.chunk_id)?;
        Ok(())
    }

    pub async fn get_blocks(&self, request: GetBlocksRequest) -> Result<GetBlocksResponse, Error> {
        let chunk_id = request.chunk_id;
        let throttling = self.is_read_throttling();

        let has_complete_chunk = self.node.chunk_store().find_chunk(chunk_id).is_some();
        let mut blocks: Vec<BlockInfo> = request
            .block_indexes
            .iter()
            .map(|_| BlockInfo::default())
            .collect();

        if throttling {
            // cannot serve the payload right now; suggest other peers instead
            for (slot, block_index) in blocks.iter_mut().zip(&request.block_indexes) {
                let block_id = BlockId::new(chunk_id, *block_index);
                let peers = self.node.peer_block_table().peers(block_id);
                if !peers.is_empty() {
                    log::debug!(
                        "{} peers suggested for block {}",
                        peers.len(),
                        block_id
                    );
                    slot.peer_addresses = peers.into_iter().map(|peer| peer.address).collect();
                }
            }
        } else {
            let mut fetches = FuturesUnordered::new();
            for (position, block_index) in request.block_indexes.iter().enumerate() {
                let block_id = BlockId::new(chunk_id, *block_index);
                let block_store = Arc::clone(self.node.block_store());
                let enable_caching = request.enable_caching;
                fetches.push(async move {
                    (position, block_store.get_block(block_id, enable_caching).await)
                });
            }

            while let Some((position, result)) = fetches.next().await {
                match result {
                    Ok(block) => {
                        blocks[position].data_attached = true;
                        blocks[position].data = Some(block.data().clone());
                    }
                    Err(err) if has_code(&err, ErrorCode::NoSuchChunk) => {
                        // neither the complete chunk nor this cached block
                        log::debug!(
                            "chunk {} is missing, block {} not cached",
                            chunk_id,
                            request.block_indexes[position]
                        );
                    }
                    Err(err) => {
                        // dropping the stream cancels the remaining fetches
                        return Err(err);
                    }
                }
            }
        }

        // remember the caller as a peer for everything we actually served
        if let Some(peer) = &request.peer {
            for (slot, block_index) in blocks.iter().zip(&request.block_indexes) {
                if slot.data_attached {
                    self.node.peer_block_table().update_peer(
                        BlockId::new(chunk_id, *block_index),
                        PeerInfo {
                            address: peer.address.clone(),
                            expires_at: peer.expires_at,
                        },
                    );
                }
            }
        }

        Ok(GetBlocksResponse {
            has_complete_chunk,
            blocks,
        })
    }

    pub async fn get_chunk_meta(
        &self,
        request: GetChunkMetaRequest,
    ) -> Result<GetChunkMetaResponse, Error> {
        let chunk = self
            .node
            .chunk_registry()
            .find_chunk(request.chunk_id)
            .ok_or_else(|| {
                node_error(
                    ErrorCode::NoSuchChunk,
                    format!("no such chunk: {}", request.chunk_id),
                )
            })?;

        let tags = if request.all_extension_tags {
            None
        } else {
            Some(request.extension_tags.as_slice())
        };
        let mut meta = chunk.meta_filtered(tags).await?;

        if let Some(partition_tag) = request.partition_tag {
            if let Some(ext) = meta.find_extension(PARTITIONS_EXT_TAG) {
                let mut partitions = PartitionsExt::decode(&ext.body)
                    .context("corrupt partitions extension")?;
                partitions.retain_partition(partition_tag);
                meta.set_extension(PARTITIONS_EXT_TAG, partitions.encode());
            }
        }

        Ok(GetChunkMetaResponse { meta })
    }

    pub async fn precache_chunk(&self, request: PrecacheChunkRequest) -> Result<(), Error> {
        self.node
            .chunk_cache()
            .download_chunk(request.chunk_id)
            .await
            .map(|_| ())
            .map_err(|err| {
                err.context(NodeError::new(
                    ErrorCode::ChunkPrecachingFailed,
                    format!("error precaching chunk {}", request.chunk_id),
                ))
            })
    }

    /// One-way: no reply, failures are logged by the transport if at all.
    pub fn update_peer(&self, request: UpdatePeerRequest) {
        for block_id in request.block_ids {
            self.node.peer_block_table().update_peer(
                block_id,
                PeerInfo {
                    address: request.peer.address.clone(),
                    expires_at: request.peer.expires_at,
                },
            );
        }
    }
}
