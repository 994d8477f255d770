//! In-memory chunk handles.
//!
//! A handle existing implies both on-disk files exist on its location. Meta
//! is loaded lazily on first request and memoized. Removal respects active
//! readers: with readers attached it is deferred until the last one drops.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Error;

use hold_api_types::{ChunkDescriptor, ChunkId, ChunkInfo, ChunkMeta};
use hold_tools::weight_cache::Weighted;

use crate::chunk_file;
use crate::location::Location;

/// Event fired by the chunk store / chunk cache registries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    Added(ChunkId),
    Removed(ChunkId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Persistent; lives until removed by cluster command.
    Stored,
    /// Lives in the cache location; evictable by weight.
    Cached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RemovalState {
    None,
    /// Removal wanted, readers still attached.
    Requested,
    Scheduled,
}

pub struct Chunk {
    id: ChunkId,
    kind: ChunkKind,
    info: ChunkInfo,
    location: Arc<Location>,
    meta: tokio::sync::OnceCell<Arc<ChunkMeta>>,
    reader_count: AtomicI64,
    removal: Mutex<RemovalState>,
}

impl Chunk {
    pub fn new(
        id: ChunkId,
        kind: ChunkKind,
        info: ChunkInfo,
        location: Arc<Location>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            info,
            location,
            meta: tokio::sync::OnceCell::new(),
            reader_count: AtomicI64::new(0),
            removal: Mutex::new(RemovalState::None),
        })
    }

    /// Handle for a chunk found by the startup scan. The descriptor size
    /// covers data plus sidecar.
    pub fn from_descriptor(
        kind: ChunkKind,
        descriptor: &ChunkDescriptor,
        location: Arc<Location>,
    ) -> Arc<Self> {
        Self::new(
            descriptor.id,
            kind,
            ChunkInfo::new(descriptor.disk_size),
            location,
        )
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn info(&self) -> ChunkInfo {
        self.info
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn reader_count(&self) -> i64 {
        self.reader_count.load(Ordering::SeqCst)
    }

    /// The full meta, loaded from the sidecar on the location's meta queue
    /// on first use. Concurrent callers coalesce on one load.
    pub async fn meta(&self) -> Result<Arc<ChunkMeta>, Error> {
        let loaded = self
            .meta
            .get_or_try_init(|| async {
                let path = self.location.chunk_file_name(self.id);
                let meta = self
                    .location
                    .meta_queue()
                    .run(move || chunk_file::read_meta_file(&path))
                    .await?;
                Ok::<_, Error>(Arc::new(meta))
            })
            .await?;
        Ok(Arc::clone(loaded))
    }

    /// Meta restricted to the given extension tags; `None` means all.
    pub async fn meta_filtered(&self, tags: Option<&[i32]>) -> Result<ChunkMeta, Error> {
        let meta = self.meta().await?;
        Ok(match tags {
            Some(tags) => meta.filtered(tags),
            None => (*meta).clone(),
        })
    }

    /// Attach a reader reference, deferring any removal until release.
    pub fn start_read(self: &Arc<Self>) -> ChunkReadGuard {
        self.reader_count.fetch_add(1, Ordering::SeqCst);
        ChunkReadGuard {
            chunk: Arc::clone(self),
        }
    }

    /// Request physical removal of the chunk files. Proceeds immediately
    /// when no readers are attached, otherwise when the last one drops.
    pub fn schedule_removal(self: &Arc<Self>) {
        let mut state = self.removal.lock().unwrap();
        if *state == RemovalState::Scheduled {
            return;
        }
        if self.reader_count.load(Ordering::SeqCst) == 0 {
            *state = RemovalState::Scheduled;
            drop(state);
            self.begin_removal();
        } else {
            *state = RemovalState::Requested;
        }
    }

    fn release_reader(self: &Arc<Self>) {
        if self.reader_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut state = self.removal.lock().unwrap();
        if *state == RemovalState::Requested {
            *state = RemovalState::Scheduled;
            drop(state);
            self.begin_removal();
        }
    }

    fn begin_removal(&self) {
        // eager submission; nobody needs to observe completion here
        let _ = self
            .location
            .schedule_chunk_removal(self.id, self.info.size);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.info.size)
            .finish()
    }
}

impl Weighted for Chunk {
    fn weight(&self) -> u64 {
        self.info.size
    }
}

/// Keeps the chunk's files alive while a reader uses them.
pub struct ChunkReadGuard {
    chunk: Arc<Chunk>,
}

impl ChunkReadGuard {
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

impl Drop for ChunkReadGuard {
    fn drop(&mut self) {
        self.chunk.release_reader();
    }
}
