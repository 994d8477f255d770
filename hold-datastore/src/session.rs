//! One write session per chunk being uploaded.
//!
//! The session accepts blocks into a sliding window, hands them to the
//! location's write queue strictly in index order and resolves a per-slot
//! promise once a block is safely on disk. Flushing advances the window
//! start past the written prefix and releases the slots. The session ends
//! in `finish` (meta sidecar written, chunk registered) or `cancel`
//! (partial files deleted, outstanding promises failed).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, format_err, Error};
use bytes::Bytes;

use hold_api_types::error::{node_error, ErrorCode};
use hold_api_types::{BlockId, ChunkId, ChunkMeta};
use hold_tools::lease::Lease;
use hold_tools::shared_promise::SharedPromise;

use crate::block_store::BlockStore;
use crate::chunk::{Chunk, ChunkKind};
use crate::chunk_file::ChunkFileWriter;
use crate::chunk_store::ChunkStore;
use crate::location::Location;
use crate::remote::BlockReplicator;
use crate::session_manager::SessionManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Received,
    Written,
}

struct Slot {
    state: SlotState,
    block: Option<Bytes>,
    written: SharedPromise<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            block: None,
            written: SharedPromise::new(),
        }
    }
}

struct SessionInner {
    state: SessionState,
    /// Slots for indices `window_start..`; front slot is `window_start`.
    window: VecDeque<Slot>,
    window_start: u32,
    /// Next block index to hand to the write queue.
    write_index: u32,
    written_count: u32,
    /// Bytes received and not yet released back.
    byte_count: u64,
}

pub struct Session {
    chunk_id: ChunkId,
    location: Arc<Location>,
    chunk_store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    replicator: Arc<dyn BlockReplicator>,
    manager: Weak<SessionManager>,
    pending_write_size: Arc<AtomicI64>,

    writer: Arc<Mutex<Option<ChunkFileWriter>>>,
    inner: Mutex<SessionInner>,
    lease: Mutex<Option<Lease>>,
    slot_released: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chunk_id: ChunkId,
        location: Arc<Location>,
        chunk_store: Arc<ChunkStore>,
        block_store: Arc<BlockStore>,
        replicator: Arc<dyn BlockReplicator>,
        manager: Weak<SessionManager>,
        pending_write_size: Arc<AtomicI64>,
    ) -> Arc<Self> {
        location.update_session_count(1);
        Arc::new(Self {
            chunk_id,
            location,
            chunk_store,
            block_store,
            replicator,
            manager,
            pending_write_size,
            writer: Arc::new(Mutex::new(None)),
            inner: Mutex::new(SessionInner {
                state: SessionState::Active,
                window: VecDeque::new(),
                window_start: 0,
                write_index: 0,
                written_count: 0,
                byte_count: 0,
            }),
            lease: Mutex::new(None),
            slot_released: AtomicBool::new(false),
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn window_start(&self) -> u32 {
        self.inner.lock().unwrap().window_start
    }

    pub fn written_block_count(&self) -> u32 {
        self.inner.lock().unwrap().written_count
    }

    pub fn byte_count(&self) -> u64 {
        self.inner.lock().unwrap().byte_count
    }

    pub(crate) fn set_lease(&self, lease: Lease) {
        *self.lease.lock().unwrap() = Some(lease);
    }

    pub fn renew_lease(&self) {
        if let Some(lease) = &*self.lease.lock().unwrap() {
            lease.renew();
        }
    }

    fn close_lease(&self) {
        if let Some(lease) = &*self.lease.lock().unwrap() {
            lease.close();
        }
    }

    pub(crate) fn release_session_slot(&self) {
        if !self.slot_released.swap(true, Ordering::SeqCst) {
            self.location.update_session_count(-1);
        }
    }

    /// Open the output file on the location's write queue.
    pub(crate) async fn start(&self) -> Result<(), Error> {
        let chunk_id = self.chunk_id;
        let path = self.location.chunk_file_name(chunk_id);
        let writer_slot = Arc::clone(&self.writer);

        let result = self
            .location
            .write_queue()
            .run(move || {
                let writer = ChunkFileWriter::create(chunk_id, path)?;
                *writer_slot.lock().unwrap() = Some(writer);
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                log::debug!("chunk file opened (chunk {})", chunk_id);
                Ok(())
            }
            Err(err) => {
                self.location.disable();
                Err(err)
            }
        }
    }

    fn ensure_active(&self, inner: &SessionInner) -> Result<(), Error> {
        match inner.state {
            SessionState::Active => Ok(()),
            SessionState::Closing | SessionState::Closed => {
                bail!("session for chunk {} is already finishing", self.chunk_id)
            }
            SessionState::Cancelled => {
                bail!("session for chunk {} was cancelled", self.chunk_id)
            }
        }
    }

    fn get_slot(inner: &mut SessionInner, block_index: u32) -> &mut Slot {
        let pos = (block_index - inner.window_start) as usize;
        while inner.window.len() <= pos {
            inner.window.push_back(Slot::new());
        }
        &mut inner.window[pos]
    }

    /// Accept a block into the window. Identical duplicates are no-ops,
    /// differing content for an occupied slot is a `BlockContentMismatch`.
    /// Newly contiguous blocks are handed to the write queue in index order.
    pub async fn put_block(
        self: &Arc<Self>,
        block_index: u32,
        data: Bytes,
        enable_caching: bool,
    ) -> Result<(), Error> {
        self.renew_lease();
        let block_id = BlockId::new(self.chunk_id, block_index);

        let to_write = {
            let mut inner = self.inner.lock().unwrap();
            self.ensure_active(&inner)?;

            if block_index < inner.window_start {
                return Err(node_error(
                    ErrorCode::WindowError,
                    format!(
                        "accessing a block out of the window (window start {}, block index {})",
                        inner.window_start, block_index
                    ),
                ));
            }

            if !self.location.has_enough_space(data.len() as u64) {
                return Err(node_error(
                    ErrorCode::OutOfSpace,
                    format!("not enough space to put block {}", block_id),
                ));
            }

            let window_start = inner.window_start;
            {
                let slot = Self::get_slot(&mut inner, block_index);
                if slot.state != SlotState::Empty {
                    if slot.block.as_ref() == Some(&data) {
                        log::warn!("block {} has already been received", block_id);
                        return Ok(());
                    }
                    return Err(node_error(
                        ErrorCode::BlockContentMismatch,
                        format!(
                            "block {} with different content already received (window start {})",
                            block_id, window_start
                        ),
                    ));
                }
                slot.state = SlotState::Received;
                slot.block = Some(data.clone());
            }

            inner.byte_count += data.len() as u64;
            self.location.update_used_space(data.len() as i64);
            self.pending_write_size
                .fetch_add(data.len() as i64, Ordering::SeqCst);
            log::debug!("block {} received", block_id);

            self.collect_writes(&mut inner)
        };

        if enable_caching {
            self.block_store.put_block(block_id, data, None).await?;
        }

        for (index, block) in to_write {
            self.issue_write(index, block);
        }
        Ok(())
    }

    /// Blocks becoming contiguous from `write_index` are issued now; the
    /// advanced `write_index` keeps later calls from issuing them twice.
    fn collect_writes(&self, inner: &mut SessionInner) -> Vec<(u32, Bytes)> {
        let mut to_write = Vec::new();
        loop {
            let index = inner.write_index;
            if index < inner.window_start {
                inner.write_index = inner.window_start;
                continue;
            }
            let pos = (index - inner.window_start) as usize;
            match inner.window.get(pos) {
                Some(slot) if slot.state == SlotState::Received => match &slot.block {
                    Some(block) => {
                        to_write.push((index, block.clone()));
                        inner.write_index += 1;
                    }
                    None => break,
                },
                _ => break,
            }
        }
        to_write
    }

    /// The submission happens right here, synchronously, so the write queue
    /// sees blocks strictly in issue order; only result handling is spawned.
    fn issue_write(self: &Arc<Self>, block_index: u32, data: Bytes) {
        let size = data.len() as i64;
        log::debug!("start writing block {} of chunk {}", block_index, self.chunk_id);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let writer_slot = Arc::clone(&self.writer);
        self.location.write_queue().submit(move || {
            let result = {
                let mut guard = writer_slot.lock().unwrap();
                match guard.as_mut() {
                    Some(writer) => writer.write_block(&data),
                    None => Err(format_err!("chunk writer already closed")),
                }
            };
            let _ = tx.send(result);
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(format_err!("write task dropped")),
            };

            this.pending_write_size.fetch_sub(size, Ordering::SeqCst);

            match result {
                Ok(()) => this.on_block_written(block_index),
                Err(err) => this.on_write_failed(block_index, err).await,
            }
        });
    }

    fn on_block_written(&self, block_index: u32) {
        let promise = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Active {
                return;
            }
            if block_index < inner.window_start {
                return;
            }
            let pos = (block_index - inner.window_start) as usize;
            let written = match inner.window.get_mut(pos) {
                Some(slot) => {
                    slot.state = SlotState::Written;
                    slot.written.clone()
                }
                None => return,
            };
            inner.written_count += 1;
            written
        };
        promise.set(Ok(()));
        log::debug!("block {} of chunk {} written", block_index, self.chunk_id);
    }

    async fn on_write_failed(self: &Arc<Self>, block_index: u32, err: Error) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Active {
                // cancellation already in progress, the failure is expected
                return;
            }
        }
        log::error!(
            "error writing block {} of chunk {} - {:#}",
            block_index,
            self.chunk_id,
            err
        );
        self.location.disable();

        // cancel through the manager so the session map stays consistent
        match self.manager.upgrade() {
            Some(manager) => manager.cancel_session(self.chunk_id, err).await,
            None => self.cancel(err).await,
        }
    }

    /// Wait for the block to be on disk, then advance the window past it.
    pub async fn flush_block(&self, block_index: u32) -> Result<(), Error> {
        self.renew_lease();

        let listener = {
            let inner = self.inner.lock().unwrap();
            self.ensure_active(&inner)?;

            if block_index < inner.window_start {
                return Err(node_error(
                    ErrorCode::WindowError,
                    format!(
                        "accessing a block out of the window (window start {}, block index {})",
                        inner.window_start, block_index
                    ),
                ));
            }

            let window_len = inner.window.len();
            let pos = (block_index - inner.window_start) as usize;
            match inner.window.get(pos) {
                Some(slot) if slot.state != SlotState::Empty => slot.written.listen(),
                _ => {
                    return Err(node_error(
                        ErrorCode::WindowError,
                        format!(
                            "flushing an empty block (window start {}, window size {}, block index {})",
                            inner.window_start, window_len, block_index
                        ),
                    ))
                }
            }
        };

        listener.await?;

        let mut inner = self.inner.lock().unwrap();
        while inner.window_start <= block_index {
            if inner.window.pop_front().is_none() {
                break;
            }
            inner.window_start += 1;
        }
        log::debug!(
            "released blocks of chunk {} (window start {})",
            self.chunk_id,
            inner.window_start
        );
        Ok(())
    }

    /// Push a range of window blocks to another data node.
    pub async fn send_blocks(
        &self,
        first_block_index: u32,
        block_count: u32,
        target_address: &str,
    ) -> Result<(), Error> {
        self.renew_lease();

        let blocks = {
            let inner = self.inner.lock().unwrap();
            self.ensure_active(&inner)?;

            let mut blocks = Vec::with_capacity(block_count as usize);
            for index in first_block_index..first_block_index + block_count {
                let slot = if index >= inner.window_start {
                    inner.window.get((index - inner.window_start) as usize)
                } else {
                    None
                };
                match slot.and_then(|slot| slot.block.as_ref()) {
                    Some(block) => blocks.push(block.clone()),
                    None => {
                        return Err(node_error(
                            ErrorCode::WindowError,
                            format!(
                                "sending a block that is not in the window (window start {}, block index {})",
                                inner.window_start, index
                            ),
                        ))
                    }
                }
            }
            blocks
        };

        self.replicator
            .replicate_blocks(target_address, self.chunk_id, first_block_index, blocks)
            .await
    }

    /// Close the output writer, write the meta sidecar and register the
    /// finished chunk with the chunk store.
    pub async fn finish(&self, meta: &ChunkMeta) -> Result<Arc<Chunk>, Error> {
        self.close_lease();

        {
            let mut inner = self.inner.lock().unwrap();
            self.ensure_active(&inner)?;

            let window_start = inner.window_start;
            for (pos, slot) in inner.window.iter().enumerate() {
                if slot.state == SlotState::Received {
                    return Err(node_error(
                        ErrorCode::WindowError,
                        format!(
                            "finishing a session with an unwritten block (window start {}, block index {})",
                            window_start,
                            window_start + pos as u32
                        ),
                    ));
                }
            }
            inner.state = SessionState::Closing;
        }

        let writer_slot = Arc::clone(&self.writer);
        let meta = meta.clone();
        let close_result = self
            .location
            .write_queue()
            .run(move || {
                let writer = writer_slot
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| format_err!("chunk writer already closed"))?;
                writer.close(&meta)
            })
            .await;

        let info = match close_result {
            Ok(info) => info,
            Err(err) => {
                self.location.disable();
                self.do_cancel(format_err!("{:#}", err)).await;
                return Err(err);
            }
        };
        log::debug!("chunk file closed (chunk {})", self.chunk_id);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::Closed;
            self.location
                .update_used_space(-(inner.byte_count as i64));
            inner.byte_count = 0;
            inner.window.clear();
        }
        self.release_session_slot();

        let chunk = Chunk::new(
            self.chunk_id,
            ChunkKind::Stored,
            info,
            Arc::clone(&self.location),
        );
        self.chunk_store.register_chunk(Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Terminal: fail outstanding promises, delete partial files, release
    /// reserved space and the location's session slot.
    pub async fn cancel(&self, err: Error) {
        self.close_lease();
        self.do_cancel(err).await;
    }

    async fn do_cancel(&self, err: Error) {
        let (promises, unissued_bytes, byte_count) = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, SessionState::Closed | SessionState::Cancelled) {
                return;
            }
            inner.state = SessionState::Cancelled;

            let mut promises = Vec::new();
            let mut unissued_bytes = 0i64;
            let window_start = inner.window_start;
            for (pos, slot) in inner.window.iter().enumerate() {
                if slot.state != SlotState::Received {
                    continue;
                }
                let index = window_start + pos as u32;
                if index >= inner.write_index {
                    // never handed to the write queue, nobody else will
                    // balance the pending write counter
                    if let Some(block) = &slot.block {
                        unissued_bytes += block.len() as i64;
                    }
                }
                promises.push(slot.written.clone());
            }
            inner.window.clear();
            let byte_count = inner.byte_count;
            inner.byte_count = 0;
            (promises, unissued_bytes, byte_count)
        };

        self.pending_write_size
            .fetch_sub(unissued_bytes, Ordering::SeqCst);

        let message = format!("{:#}", err);
        for promise in promises {
            promise.set(Err(format_err!("{}", message)));
        }

        let writer_slot = Arc::clone(&self.writer);
        let chunk_id = self.chunk_id;
        let abort_result = self
            .location
            .write_queue()
            .run(move || match writer_slot.lock().unwrap().take() {
                Some(writer) => writer.abort(),
                None => Ok(()),
            })
            .await;
        if let Err(abort_err) = abort_result {
            log::warn!(
                "error deleting partial chunk {} - {:#}",
                chunk_id,
                abort_err
            );
        }

        self.location.update_used_space(-(byte_count as i64));
        self.release_session_slot();
        log::info!("session for chunk {} cancelled - {}", chunk_id, message);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chunk_id", &self.chunk_id)
            .field("state", &self.state())
            .finish()
    }
}
