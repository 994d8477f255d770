//! Registry of persisted chunks across all store locations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Error, format_err};
use rand::Rng;
use tokio::sync::broadcast;

use hold_api_types::error::{node_error, ErrorCode};
use hold_api_types::{CellGuid, ChunkId};

use crate::chunk::{Chunk, ChunkEvent, ChunkKind};
use crate::location::Location;

pub struct ChunkStore {
    locations: Vec<Arc<Location>>,
    chunks: Mutex<HashMap<ChunkId, Arc<Chunk>>>,
    cell_guid: Mutex<Option<CellGuid>>,
    events: broadcast::Sender<ChunkEvent>,
}

impl ChunkStore {
    /// Scan every store location and register all chunks found. A duplicate
    /// chunk id across locations and disagreeing cell guids are fatal.
    pub fn initialize(locations: Vec<Arc<Location>>) -> Result<Arc<Self>, Error> {
        let (events, _) = broadcast::channel(256);
        let store = Arc::new(Self {
            locations,
            chunks: Mutex::new(HashMap::new()),
            cell_guid: Mutex::new(None),
            events,
        });

        log::info!("chunk store scan started");
        for location in &store.locations {
            let descriptors = location.initialize().map_err(|err| {
                format_err!("failed to initialize location '{}' - {}", location.id(), err)
            })?;
            for descriptor in descriptors {
                let chunk =
                    Chunk::from_descriptor(ChunkKind::Stored, &descriptor, Arc::clone(location));
                store.register_chunk(chunk);
            }
        }
        store.reconcile_cell_guids()?;
        log::info!(
            "chunk store scan completed, {} chunks found",
            store.chunk_count()
        );

        Ok(store)
    }

    fn reconcile_cell_guids(&self) -> Result<(), Error> {
        let mut adopted: Option<CellGuid> = None;
        for location in &self.locations {
            let guid = match location.cell_guid() {
                Some(guid) => guid,
                None => continue,
            };
            match adopted {
                None => adopted = Some(guid),
                Some(known) if known != guid => {
                    log::error!(
                        "fatal: inconsistent cell guid across store locations: {} vs {}",
                        known,
                        guid
                    );
                    panic!("inconsistent cell guid across store locations");
                }
                Some(_) => {}
            }
        }

        if let Some(guid) = adopted {
            self.set_cell_guid(guid)?;
        }
        Ok(())
    }

    pub fn cell_guid(&self) -> Option<CellGuid> {
        *self.cell_guid.lock().unwrap()
    }

    /// Adopt a cell guid and persist it into every location's tag file.
    pub fn set_cell_guid(&self, guid: CellGuid) -> Result<(), Error> {
        *self.cell_guid.lock().unwrap() = Some(guid);
        for location in &self.locations {
            if location.cell_guid() != Some(guid) {
                location.set_cell_guid(guid)?;
            }
        }
        Ok(())
    }

    pub fn locations(&self) -> &[Arc<Location>] {
        &self.locations
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkEvent> {
        self.events.subscribe()
    }

    /// Register a chunk, updating its location's counters. A duplicate id
    /// means two locations own the same chunk - not recoverable.
    pub fn register_chunk(&self, chunk: Arc<Chunk>) {
        let chunk_id = chunk.id();
        let size = chunk.info().size;
        let location = Arc::clone(chunk.location());

        let mut chunks = self.chunks.lock().unwrap();
        if let Some(previous) = chunks.insert(chunk_id, chunk) {
            log::error!(
                "fatal: duplicate chunk {} ({:?} vs {:?})",
                chunk_id,
                previous.location().path(),
                location.path(),
            );
            panic!("duplicate chunk {}", chunk_id);
        }
        drop(chunks);

        location.update_chunk_count(1);
        location.update_used_space(size as i64);
        log::debug!("chunk {} registered ({} bytes)", chunk_id, size);

        let _ = self.events.send(ChunkEvent::Added(chunk_id));
    }

    pub fn find_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.chunks.lock().unwrap().get(&chunk_id).cloned()
    }

    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.lock().unwrap().values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    /// Schedule physical removal, then drop the chunk from the registry and
    /// fire the removal notification.
    pub async fn remove_chunk(&self, chunk: &Arc<Chunk>) -> Result<(), Error> {
        let chunk_id = chunk.id();
        chunk
            .location()
            .schedule_chunk_removal(chunk_id, chunk.info().size)
            .await?;

        self.chunks.lock().unwrap().remove(&chunk_id);
        let _ = self.events.send(ChunkEvent::Removed(chunk_id));
        log::info!("chunk {} removed", chunk_id);
        Ok(())
    }

    /// Pick the location for a new write session: enabled, not full, with
    /// the minimum session count; ties broken randomly.
    pub fn new_chunk_location(&self) -> Result<Arc<Location>, Error> {
        let mut candidates: Vec<&Arc<Location>> = Vec::new();
        let mut min_count = i64::MAX;

        for location in &self.locations {
            if !location.is_enabled() || location.is_full() {
                continue;
            }
            let count = location.session_count();
            if count < min_count {
                candidates.clear();
                min_count = count;
            }
            if count == min_count {
                candidates.push(location);
            }
        }

        if candidates.is_empty() {
            return Err(node_error(
                ErrorCode::OutOfSpace,
                "all locations are either disabled or full",
            ));
        }

        let pick = rand::thread_rng().gen_range(0..candidates.len());
        Ok(Arc::clone(candidates[pick]))
    }
}
