//! Content-addressed read-through cache of whole chunks, backed by the
//! single cache location.
//!
//! Concurrent downloads of the same chunk id are deduplicated through the
//! weight cache's insertion cookies; exactly one download session runs per
//! id. Evicted chunks schedule their physical removal.

use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};
use futures::StreamExt;
use tokio::sync::broadcast;

use hold_api_types::{BlockSizesExt, ChunkId};
use hold_tools::weight_cache::{BeginInsert, InsertCookie, WeightCache};

use crate::chunk::{Chunk, ChunkEvent, ChunkKind};
use crate::chunk_file::ChunkFileWriter;
use crate::location::Location;
use crate::remote::RemoteChunkReader;

pub struct ChunkCache {
    location: Arc<Location>,
    cache: WeightCache<ChunkId, Arc<Chunk>>,
    remote: Arc<dyn RemoteChunkReader>,
    prefetch_window: usize,
    events: broadcast::Sender<ChunkEvent>,
}

impl ChunkCache {
    /// Scan the cache location and adopt every complete chunk found there.
    pub fn initialize(
        location: Arc<Location>,
        remote: Arc<dyn RemoteChunkReader>,
        weight_limit: u64,
        max_chunks: usize,
        prefetch_window: usize,
    ) -> Result<Arc<Self>, Error> {
        let (events, _) = broadcast::channel(256);
        let cache = Arc::new(Self {
            cache: WeightCache::new(weight_limit, max_chunks),
            location,
            remote,
            prefetch_window: prefetch_window.max(1),
            events,
        });

        log::info!("chunk cache scan started");
        let descriptors = cache.location.initialize()?;
        for descriptor in &descriptors {
            let chunk =
                Chunk::from_descriptor(ChunkKind::Cached, descriptor, Arc::clone(&cache.location));
            match cache.cache.begin_insert(descriptor.id) {
                BeginInsert::Inserted(cookie) => {
                    cache.location.update_chunk_count(1);
                    cache.location.update_used_space(chunk.info().size as i64);
                    let evicted = cookie.complete(chunk);
                    cache.handle_evicted(evicted);
                }
                _ => bail!("cache location lists chunk {} twice", descriptor.id),
            }
        }
        log::info!(
            "chunk cache scan completed, {} chunks found",
            descriptors.len()
        );

        Ok(cache)
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkEvent> {
        self.events.subscribe()
    }

    /// Cache lookup only; never triggers a download.
    pub fn find_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.cache.find(&chunk_id)
    }

    pub fn chunk_count(&self) -> usize {
        self.cache.len()
    }

    /// Fetch the chunk into the cache, deduplicating concurrent calls per
    /// chunk id: the winner drives a download session, everyone else awaits
    /// its outcome.
    pub async fn download_chunk(self: &Arc<Self>, chunk_id: ChunkId) -> Result<Arc<Chunk>, Error> {
        match self.cache.begin_insert(chunk_id) {
            BeginInsert::Cached(chunk) => {
                log::info!("chunk {} is already cached", chunk_id);
                Ok(chunk)
            }
            BeginInsert::Pending(pending) => pending.await,
            BeginInsert::Inserted(cookie) => {
                log::info!("loading chunk {} into cache", chunk_id);
                self.run_download_session(chunk_id, cookie).await
            }
        }
    }

    async fn run_download_session(
        &self,
        chunk_id: ChunkId,
        cookie: InsertCookie<ChunkId, Arc<Chunk>>,
    ) -> Result<Arc<Chunk>, Error> {
        match self.download(chunk_id).await {
            Ok(chunk) => {
                self.location.update_chunk_count(1);
                self.location.update_used_space(chunk.info().size as i64);
                let evicted = cookie.complete(Arc::clone(&chunk));
                self.handle_evicted(evicted);
                log::info!("chunk {} downloaded into cache", chunk_id);
                let _ = self.events.send(ChunkEvent::Added(chunk_id));
                Ok(chunk)
            }
            Err(err) => {
                let wrapped =
                    err.context(format!("error downloading chunk {} into cache", chunk_id));
                log::warn!("{:#}", wrapped);
                cookie.cancel(format_err!("{:#}", wrapped));
                Err(wrapped)
            }
        }
    }

    async fn download(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>, Error> {
        let path = self.location.chunk_file_name(chunk_id);
        let writer = self
            .location
            .write_queue()
            .run(move || ChunkFileWriter::create(chunk_id, path))
            .await
            .unwrap_or_else(|err| {
                // cache location I/O is load bearing for the whole process
                log::error!("fatal: error opening cached chunk for writing - {:#}", err);
                panic!("error opening cached chunk for writing: {:#}", err);
            });
        let writer = Arc::new(Mutex::new(Some(writer)));

        let result = self.fetch_blocks(chunk_id, &writer).await;
        if result.is_err() {
            let slot = Arc::clone(&writer);
            self.location.write_queue().submit(move || {
                if let Some(writer) = slot.lock().unwrap().take() {
                    let _ = writer.abort();
                }
            });
        }
        result
    }

    async fn fetch_blocks(
        &self,
        chunk_id: ChunkId,
        writer: &Arc<Mutex<Option<ChunkFileWriter>>>,
    ) -> Result<Arc<Chunk>, Error> {
        let meta = self
            .remote
            .fetch_meta(chunk_id)
            .await
            .context("error fetching chunk meta")?;
        let block_sizes = BlockSizesExt::from_meta(&meta)?.block_sizes;
        let block_count = block_sizes.len() as u32;

        // sequential read with a bounded prefetch window
        let remote = Arc::clone(&self.remote);
        let mut blocks = futures::stream::iter((0..block_count).map(move |index| {
            let remote = Arc::clone(&remote);
            async move { (index, remote.read_block(chunk_id, index).await) }
        }))
        .buffered(self.prefetch_window);

        while let Some((index, result)) = blocks.next().await {
            let data = result.with_context(|| format!("error fetching block {}", index))?;
            if data.len() as u64 != block_sizes[index as usize] {
                bail!(
                    "block {} size mismatch: meta says {}, got {}",
                    index,
                    block_sizes[index as usize],
                    data.len()
                );
            }

            let slot = Arc::clone(writer);
            self.location
                .write_queue()
                .run(move || {
                    let mut guard = slot.lock().unwrap();
                    let writer = guard
                        .as_mut()
                        .ok_or_else(|| format_err!("chunk writer already gone"))?;
                    writer.write_block(&data)
                })
                .await
                .with_context(|| format!("error writing block {}", index))?;
        }
        drop(blocks);

        let slot = Arc::clone(writer);
        let info = self
            .location
            .write_queue()
            .run(move || {
                let writer = slot
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| format_err!("chunk writer already gone"))?;
                writer.close(&meta)
            })
            .await
            .context("error closing cached chunk")?;

        Ok(Chunk::new(
            chunk_id,
            ChunkKind::Cached,
            info,
            Arc::clone(&self.location),
        ))
    }

    fn handle_evicted(&self, evicted: Vec<(ChunkId, Arc<Chunk>)>) {
        for (chunk_id, chunk) in evicted {
            log::info!("evicting cached chunk {}", chunk_id);
            chunk.schedule_removal();
            let _ = self.events.send(ChunkEvent::Removed(chunk_id));
        }
    }
}
