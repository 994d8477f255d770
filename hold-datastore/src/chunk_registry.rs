//! Unified chunk lookup over the persistent store and the cache.

use std::sync::Arc;

use hold_api_types::ChunkId;

use crate::chunk::Chunk;
use crate::chunk_cache::ChunkCache;
use crate::chunk_store::ChunkStore;

pub struct ChunkRegistry {
    store: Arc<ChunkStore>,
    cache: Arc<ChunkCache>,
}

impl ChunkRegistry {
    pub fn new(store: Arc<ChunkStore>, cache: Arc<ChunkCache>) -> Arc<Self> {
        Arc::new(Self { store, cache })
    }

    /// Stored chunks win over cached ones.
    pub fn find_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.store
            .find_chunk(chunk_id)
            .or_else(|| self.cache.find_chunk(chunk_id))
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }
}
