//! Read path for chunk blocks: a weight-limited block cache in front of the
//! per-location disk readers.
//!
//! At most one disk load is in flight per block id; duplicate `get_block`
//! calls share the same future and resolve to the same cached block. A
//! `put_block` hitting an existing entry with different content is a fatal
//! inconsistency.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{format_err, Error};
use bytes::Bytes;

use hold_api_types::error::{node_error, ErrorCode};
use hold_api_types::BlockId;
use hold_tools::task_queue::IoClass;
use hold_tools::weight_cache::{BeginInsert, WeightCache, Weighted};

use crate::chunk_registry::ChunkRegistry;
use crate::reader_cache::ReaderCache;

/// A block held in the cache, together with the address it was received
/// from (if any); the source feeds the peer announcement task.
#[derive(Debug)]
pub struct CachedBlock {
    block_id: BlockId,
    data: Bytes,
    source: Option<String>,
}

impl CachedBlock {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl Weighted for CachedBlock {
    fn weight(&self) -> u64 {
        self.data.len() as u64
    }
}

pub struct BlockStore {
    cache: WeightCache<BlockId, Arc<CachedBlock>>,
    registry: Arc<ChunkRegistry>,
    reader_cache: Arc<ReaderCache>,
    pending_read_size: AtomicI64,
}

struct PendingReadGuard<'a> {
    counter: &'a AtomicI64,
    size: i64,
}

impl<'a> PendingReadGuard<'a> {
    fn new(counter: &'a AtomicI64, size: i64) -> Self {
        counter.fetch_add(size, Ordering::SeqCst);
        Self { counter, size }
    }
}

impl Drop for PendingReadGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.size, Ordering::SeqCst);
    }
}

impl BlockStore {
    pub fn new(
        registry: Arc<ChunkRegistry>,
        reader_cache: Arc<ReaderCache>,
        max_weight: u64,
        max_blocks: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: WeightCache::new(max_weight, max_blocks),
            registry,
            reader_cache,
            pending_read_size: AtomicI64::new(0),
        })
    }

    /// Bytes currently scheduled on disk executors but not yet delivered.
    pub fn pending_read_size(&self) -> i64 {
        self.pending_read_size.load(Ordering::SeqCst)
    }

    /// Cache-only lookup.
    pub fn find_block(&self, block_id: BlockId) -> Option<Arc<CachedBlock>> {
        self.cache.find(&block_id)
    }

    /// Snapshot of all cached blocks, for peer announcements.
    pub fn get_all_blocks(&self) -> Vec<Arc<CachedBlock>> {
        self.cache.get_all()
    }

    /// Insert a block received from the write path or a peer. Idempotent for
    /// identical content; differing content for the same id aborts the
    /// process, since two disagreeing sources would corrupt reads.
    pub async fn put_block(
        &self,
        block_id: BlockId,
        data: Bytes,
        source: Option<String>,
    ) -> Result<Arc<CachedBlock>, Error> {
        loop {
            match self.cache.begin_insert(block_id) {
                BeginInsert::Inserted(cookie) => {
                    let block = Arc::new(CachedBlock {
                        block_id,
                        data,
                        source,
                    });
                    cookie.complete(Arc::clone(&block));
                    log::debug!("block {} put into cache ({} bytes)", block_id, block.data.len());
                    return Ok(block);
                }
                BeginInsert::Cached(existing) => {
                    return Ok(Self::check_matching_content(block_id, existing, &data));
                }
                BeginInsert::Pending(pending) => match pending.await {
                    Ok(existing) => {
                        return Ok(Self::check_matching_content(block_id, existing, &data));
                    }
                    Err(_) => {
                        // a parallel load failed; retry the insertion
                        continue;
                    }
                },
            }
        }
    }

    fn check_matching_content(
        block_id: BlockId,
        existing: Arc<CachedBlock>,
        data: &Bytes,
    ) -> Arc<CachedBlock> {
        if existing.data != *data {
            log::error!(
                "fatal: block {} already cached with different content",
                block_id
            );
            panic!("block {} already cached with different content", block_id);
        }
        log::debug!("block {} already cached, reusing", block_id);
        existing
    }

    /// Fetch a block: from the cache, or from disk through the owning
    /// chunk's location. With `enable_caching` unset a successful disk read
    /// is handed out without being kept.
    pub async fn get_block(
        &self,
        block_id: BlockId,
        enable_caching: bool,
    ) -> Result<Arc<CachedBlock>, Error> {
        match self.cache.begin_insert(block_id) {
            BeginInsert::Cached(block) => {
                log::debug!("block cache hit ({})", block_id);
                Ok(block)
            }
            BeginInsert::Pending(pending) => match pending.await {
                Ok(block) => Ok(block),
                // the shared future carries a rendered message; restore the
                // typed code the caller dispatches on
                Err(err) => {
                    if self.registry.find_chunk(block_id.chunk_id).is_none() {
                        Err(node_error(
                            ErrorCode::NoSuchChunk,
                            format!("no such chunk: {}", block_id.chunk_id),
                        ))
                    } else {
                        Err(err)
                    }
                }
            },
            BeginInsert::Inserted(cookie) => {
                log::debug!("block cache miss ({})", block_id);
                match self.read_from_disk(block_id).await {
                    Ok(block) => {
                        if enable_caching {
                            cookie.complete(Arc::clone(&block));
                        } else {
                            cookie.complete_uncached(Arc::clone(&block));
                        }
                        Ok(block)
                    }
                    Err(err) => {
                        cookie.cancel(format_err!("{:#}", err));
                        Err(err)
                    }
                }
            }
        }
    }

    async fn read_from_disk(&self, block_id: BlockId) -> Result<Arc<CachedBlock>, Error> {
        let chunk = self.registry.find_chunk(block_id.chunk_id).ok_or_else(|| {
            node_error(
                ErrorCode::NoSuchChunk,
                format!("no such chunk: {}", block_id.chunk_id),
            )
        })?;

        let guard = chunk.start_read();
        let reader = self.reader_cache.reader(guard.chunk()).await?;

        let block_size = reader.block_size(block_id.block_index).ok_or_else(|| {
            format_err!(
                "chunk {} has no block {}",
                block_id.chunk_id,
                block_id.block_index
            )
        })? as i64;

        // the guard keeps the counter honest even when the caller abandons
        // the read mid-flight
        let pending = PendingReadGuard::new(&self.pending_read_size, block_size);
        log::debug!(
            "pending read size increased by {} (now {})",
            block_size,
            self.pending_read_size()
        );

        let index = block_id.block_index;
        let read_reader = Arc::clone(&reader);
        let result = chunk
            .location()
            .read_queue()
            .run(IoClass::User, move || read_reader.read_block(index))
            .await;

        drop(pending);
        log::debug!(
            "pending read size decreased by {} (now {})",
            block_size,
            self.pending_read_size()
        );

        let data = result?;
        drop(guard);

        Ok(Arc::new(CachedBlock {
            block_id,
            data,
            source: None,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::{Chunk, ChunkKind};
    use crate::chunk_cache::ChunkCache;
    use crate::chunk_file::ChunkFileWriter;
    use crate::chunk_store::ChunkStore;
    use crate::location::{Location, LocationType};
    use crate::remote::RemoteChunkReader;
    use hold_api_types::config::LocationConfig;
    use hold_api_types::error::has_code;
    use hold_api_types::{ChunkId, ChunkMeta};

    struct NoRemote;

    #[async_trait::async_trait]
    impl RemoteChunkReader for NoRemote {
        async fn fetch_meta(&self, _chunk_id: ChunkId) -> Result<ChunkMeta, Error> {
            anyhow::bail!("no remote in this test")
        }
        async fn read_block(&self, _chunk_id: ChunkId, _index: u32) -> Result<Bytes, Error> {
            anyhow::bail!("no remote in this test")
        }
    }

    struct Setup {
        store: Arc<ChunkStore>,
        block_store: Arc<BlockStore>,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let store_location = Location::new(
            LocationType::Store,
            "store0",
            LocationConfig::new(dir.path().join("store")),
        );
        let cache_location = Location::new(
            LocationType::Cache,
            "cache",
            LocationConfig::new(dir.path().join("cache")),
        );

        let store = ChunkStore::initialize(vec![store_location]).unwrap();
        let cache =
            ChunkCache::initialize(cache_location, Arc::new(NoRemote), u64::MAX, 64, 4).unwrap();
        let registry = ChunkRegistry::new(Arc::clone(&store), cache);
        let reader_cache = ReaderCache::new(16);
        let block_store = BlockStore::new(registry, reader_cache, 1024 * 1024, 1024);

        Setup {
            store,
            block_store,
            _dir: dir,
        }
    }

    fn write_chunk(setup: &Setup, hex: &str, blocks: &[&[u8]]) -> ChunkId {
        let chunk_id: ChunkId = hex.parse().unwrap();
        let location = Arc::clone(&setup.store.locations()[0]);
        let mut writer =
            ChunkFileWriter::create(chunk_id, location.chunk_file_name(chunk_id)).unwrap();
        for block in blocks {
            writer.write_block(block).unwrap();
        }
        let info = writer.close(&ChunkMeta::new(1, 0)).unwrap();
        setup
            .store
            .register_chunk(Chunk::new(chunk_id, ChunkKind::Stored, info, location));
        chunk_id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_block_reads_and_caches() {
        let setup = setup();
        let chunk_id = write_chunk(&setup, "aa00000000000000000000000000000a", &[b"one", b"two"]);

        let block = setup
            .block_store
            .get_block(BlockId::new(chunk_id, 1), true)
            .await
            .unwrap();
        assert_eq!(block.data(), &Bytes::from_static(b"two"));
        assert_eq!(setup.block_store.pending_read_size(), 0);

        // second fetch is a cache hit returning the same instance
        let again = setup
            .block_store
            .get_block(BlockId::new(chunk_id, 1), true)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&block, &again));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_block_uncached(){
        let setup = setup();
        let chunk_id = write_chunk(&setup, "aa00000000000000000000000000000b", &[b"solo"]);

        let block = setup
            .block_store
            .get_block(BlockId::new(chunk_id, 0), false)
            .await
            .unwrap();
        assert_eq!(block.data(), &Bytes::from_static(b"solo"));
        assert!(setup
            .block_store
            .find_block(BlockId::new(chunk_id, 0))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_block_no_such_chunk() {
        let setup = setup();
        let missing: ChunkId = "ff00000000000000000000000000000f".parse().unwrap();

        let err = setup
            .block_store
            .get_block(BlockId::new(missing, 0), true)
            .await
            .unwrap_err();
        assert!(has_code(&err, ErrorCode::NoSuchChunk));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_block_out_of_range() {
        let setup = setup();
        let chunk_id = write_chunk(&setup, "aa00000000000000000000000000000c", &[b"only"]);

        let err = setup
            .block_store
            .get_block(BlockId::new(chunk_id, 5), true)
            .await
            .unwrap_err();
        assert!(!has_code(&err, ErrorCode::NoSuchChunk));
        assert_eq!(setup.block_store.pending_read_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_block_idempotent() {
        let setup = setup();
        let chunk_id: ChunkId = "aa00000000000000000000000000000d".parse().unwrap();
        let block_id = BlockId::new(chunk_id, 0);

        let first = setup
            .block_store
            .put_block(block_id, Bytes::from_static(b"same"), None)
            .await
            .unwrap();
        let second = setup
            .block_store
            .put_block(block_id, Bytes::from_static(b"same"), Some("peer:1".into()))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[should_panic(expected = "different content")]
    async fn test_put_block_content_mismatch_is_fatal() {
        let setup = setup();
        let chunk_id: ChunkId = "aa00000000000000000000000000000e".parse().unwrap();
        let block_id = BlockId::new(chunk_id, 0);

        setup
            .block_store
            .put_block(block_id, Bytes::from_static(b"aaa"), None)
            .await
            .unwrap();
        let _ = setup
            .block_store
            .put_block(block_id, Bytes::from_static(b"bbb"), None)
            .await;
    }
}
