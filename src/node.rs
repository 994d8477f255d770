//! Assembles the storage core of one data node.

use std::sync::Arc;

use anyhow::Error;

use hold_api_types::config::DataNodeConfig;
use hold_datastore::{
    BlockReplicator, BlockStore, ChunkCache, ChunkRegistry, ChunkStore, Location, LocationType,
    PeerBlockTable, ReaderCache, RemoteChunkReader, SessionManager,
};

/// Bound of the peer-block table; entries are soft state anyway.
const PEER_BLOCK_TABLE_CAPACITY: usize = 8192;

pub struct DataNode {
    config: DataNodeConfig,
    chunk_store: Arc<ChunkStore>,
    chunk_cache: Arc<ChunkCache>,
    chunk_registry: Arc<ChunkRegistry>,
    reader_cache: Arc<ReaderCache>,
    block_store: Arc<BlockStore>,
    session_manager: Arc<SessionManager>,
    peer_block_table: Arc<PeerBlockTable>,
}

impl DataNode {
    /// Scan all locations and assemble the component graph. Background
    /// tasks (health probes, the cache-location guard) are started
    /// separately via [`DataNode::start_background_tasks`].
    pub fn bootstrap(
        config: DataNodeConfig,
        remote: Arc<dyn RemoteChunkReader>,
        replicator: Arc<dyn BlockReplicator>,
    ) -> Result<Arc<Self>, Error> {
        let store_locations = config
            .store_locations
            .iter()
            .enumerate()
            .map(|(index, location_config)| {
                Location::new(
                    LocationType::Store,
                    &format!("store{}", index),
                    location_config.clone(),
                )
            })
            .collect();
        let chunk_store = ChunkStore::initialize(store_locations)?;

        let cache_location = Location::new(
            LocationType::Cache,
            "cache",
            config.cache_location.clone(),
        );
        let chunk_cache = ChunkCache::initialize(
            cache_location,
            remote,
            config.cached_chunks_weight_limit(),
            config.max_cached_chunks,
            config.download_prefetch_window,
        )?;

        let chunk_registry = ChunkRegistry::new(Arc::clone(&chunk_store), Arc::clone(&chunk_cache));
        let reader_cache = ReaderCache::new(config.max_cached_readers);
        let block_store = BlockStore::new(
            Arc::clone(&chunk_registry),
            Arc::clone(&reader_cache),
            config.max_cached_blocks_weight,
            config.max_cached_blocks,
        );
        let session_manager = SessionManager::new(
            config.session_timeout(),
            Arc::clone(&chunk_store),
            Arc::clone(&block_store),
            replicator,
        );

        Ok(Arc::new(Self {
            config,
            chunk_store,
            chunk_cache,
            chunk_registry,
            reader_cache,
            block_store,
            session_manager,
            peer_block_table: Arc::new(PeerBlockTable::new(PEER_BLOCK_TABLE_CAPACITY)),
        }))
    }

    /// Start the disk health probes and the cache-location failure guard.
    /// Must run inside a tokio runtime.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let period = self.config.disk_health_check_period();
        for location in self.chunk_store.locations() {
            location.start_health_checker(period);
        }
        self.chunk_cache.location().start_health_checker(period);

        // a store location failing only takes that location out; the cache
        // location failing takes the process down
        let mut disabled = self.chunk_cache.location().on_disabled();
        tokio::spawn(async move {
            while disabled.changed().await.is_ok() {
                if *disabled.borrow() {
                    log::error!("fatal: cache location disabled");
                    std::process::abort();
                }
            }
        });
    }

    pub fn config(&self) -> &DataNodeConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunk_store
    }

    pub fn chunk_cache(&self) -> &Arc<ChunkCache> {
        &self.chunk_cache
    }

    pub fn chunk_registry(&self) -> &Arc<ChunkRegistry> {
        &self.chunk_registry
    }

    pub fn reader_cache(&self) -> &Arc<ReaderCache> {
        &self.reader_cache
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    pub fn peer_block_table(&self) -> &Arc<PeerBlockTable> {
        &self.peer_block_table
    }
}
