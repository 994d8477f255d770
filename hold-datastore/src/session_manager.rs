//! Tracks the write sessions of a node and their leases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Error};

use hold_api_types::error::{node_error, ErrorCode};
use hold_api_types::{ChunkId, ChunkMeta};
use hold_tools::lease::Lease;

use crate::block_store::BlockStore;
use crate::chunk::Chunk;
use crate::chunk_store::ChunkStore;
use crate::remote::BlockReplicator;
use crate::session::Session;

pub struct SessionManager {
    session_timeout: Duration,
    chunk_store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    replicator: Arc<dyn BlockReplicator>,
    sessions: Mutex<HashMap<ChunkId, Arc<Session>>>,
    pending_write_size: Arc<AtomicI64>,
}

impl SessionManager {
    pub fn new(
        session_timeout: Duration,
        chunk_store: Arc<ChunkStore>,
        block_store: Arc<BlockStore>,
        replicator: Arc<dyn BlockReplicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_timeout,
            chunk_store,
            block_store,
            replicator,
            sessions: Mutex::new(HashMap::new()),
            pending_write_size: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Open a new session: pick a store location, open the output file,
    /// install the lease.
    pub async fn start_session(self: &Arc<Self>, chunk_id: ChunkId) -> Result<Arc<Session>, Error> {
        if self.sessions.lock().unwrap().contains_key(&chunk_id) {
            return Err(node_error(
                ErrorCode::SessionAlreadyExists,
                format!("session already exists: {}", chunk_id),
            ));
        }

        let location = self.chunk_store.new_chunk_location()?;
        let session = Session::new(
            chunk_id,
            Arc::clone(&location),
            Arc::clone(&self.chunk_store),
            Arc::clone(&self.block_store),
            Arc::clone(&self.replicator),
            Arc::downgrade(self),
            Arc::clone(&self.pending_write_size),
        );

        if let Err(err) = session.start().await {
            session.release_session_slot();
            return Err(err);
        }

        let manager = Arc::downgrade(self);
        let lease = Lease::start(self.session_timeout, move || {
            if let Some(manager) = manager.upgrade() {
                tokio::spawn(async move { manager.on_lease_expired(chunk_id).await });
            }
        });
        session.set_lease(lease);

        if self
            .sessions
            .lock()
            .unwrap()
            .insert(chunk_id, Arc::clone(&session))
            .is_some()
        {
            // lost a race with a concurrent StartChunk for the same id
            session
                .cancel(format_err!("concurrent session creation for {}", chunk_id))
                .await;
            return Err(node_error(
                ErrorCode::SessionAlreadyExists,
                format!("session already exists: {}", chunk_id),
            ));
        }

        log::info!(
            "session started (chunk {}, location '{}')",
            chunk_id,
            location.id()
        );
        Ok(session)
    }

    /// Lookup; renews the lease as a side effect like any other session
    /// touch does.
    pub fn find_session(&self, chunk_id: ChunkId) -> Option<Arc<Session>> {
        let session = self.sessions.lock().unwrap().get(&chunk_id).cloned();
        if let Some(session) = &session {
            session.renew_lease();
        }
        session
    }

    pub async fn finish_session(
        &self,
        session: &Arc<Session>,
        meta: &ChunkMeta,
    ) -> Result<Arc<Chunk>, Error> {
        self.sessions.lock().unwrap().remove(&session.chunk_id());
        let chunk = session.finish(meta).await?;
        log::info!("session finished (chunk {})", session.chunk_id());
        Ok(chunk)
    }

    pub async fn cancel_session(&self, chunk_id: ChunkId, err: Error) {
        let session = self.sessions.lock().unwrap().remove(&chunk_id);
        if let Some(session) = session {
            session.cancel(err).await;
        }
    }

    async fn on_lease_expired(&self, chunk_id: ChunkId) {
        if self.sessions.lock().unwrap().contains_key(&chunk_id) {
            log::info!("session lease expired (chunk {})", chunk_id);
            self.cancel_session(chunk_id, format_err!("session lease expired"))
                .await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Bytes received but not yet written out, across all sessions.
    pub fn pending_write_size(&self) -> i64 {
        self.pending_write_size.load(Ordering::SeqCst)
    }
}
