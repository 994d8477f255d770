//! Bounded cache of open chunk file readers.
//!
//! Keyed by chunk id, LRU evicted beyond the bound. Concurrent requests for
//! the same id coalesce on a single pending open. Evicted readers close when
//! their last external reference drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use hold_api_types::ChunkId;
use hold_tools::lru_cache::LruCache;
use hold_tools::shared_promise::SharedPromise;
use hold_tools::task_queue::IoClass;

use crate::chunk::Chunk;
use crate::chunk_file::ChunkFileReader;

struct ReaderCacheState {
    ready: LruCache<ChunkId, Arc<ChunkFileReader>>,
    pending: HashMap<ChunkId, SharedPromise<Arc<ChunkFileReader>>>,
}

pub struct ReaderCache {
    capacity: usize,
    state: Mutex<ReaderCacheState>,
}

enum Lookup {
    Hit(Arc<ChunkFileReader>),
    Wait(SharedPromise<Arc<ChunkFileReader>>),
    Load(SharedPromise<Arc<ChunkFileReader>>),
}

impl ReaderCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(ReaderCacheState {
                ready: LruCache::new(),
                pending: HashMap::new(),
            }),
        })
    }

    /// Get an open reader for the chunk, opening its files on the owning
    /// location's read executor on a miss.
    pub async fn reader(&self, chunk: &Arc<Chunk>) -> Result<Arc<ChunkFileReader>, Error> {
        let chunk_id = chunk.id();

        let lookup = {
            let mut state = self.state.lock().unwrap();
            if let Some(reader) = state.ready.get(&chunk_id) {
                Lookup::Hit(Arc::clone(reader))
            } else if let Some(promise) = state.pending.get(&chunk_id) {
                Lookup::Wait(promise.clone())
            } else {
                let promise = SharedPromise::new();
                state.pending.insert(chunk_id, promise.clone());
                Lookup::Load(promise)
            }
        };

        match lookup {
            Lookup::Hit(reader) => Ok(reader),
            Lookup::Wait(promise) => promise.listen().await,
            Lookup::Load(promise) => {
                let path = chunk.location().chunk_file_name(chunk_id);
                let opened = chunk
                    .location()
                    .read_queue()
                    .run(IoClass::User, move || ChunkFileReader::open(chunk_id, &path))
                    .await;

                match opened {
                    Ok(reader) => {
                        let reader = Arc::new(reader);
                        {
                            let mut state = self.state.lock().unwrap();
                            state.pending.remove(&chunk_id);
                            state.ready.insert(chunk_id, Arc::clone(&reader));
                            while state.ready.len() > self.capacity {
                                // dropped here; the file closes with the last reference
                                state.ready.pop_lru();
                            }
                        }
                        promise.set(Ok(Arc::clone(&reader)));
                        Ok(reader)
                    }
                    Err(err) => {
                        self.state.lock().unwrap().pending.remove(&chunk_id);
                        promise.set(Err(format_err!("{:#}", err)));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Drop the cached reader of a chunk, if any.
    pub fn evict(&self, chunk_id: ChunkId) {
        self.state.lock().unwrap().ready.remove(&chunk_id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
