//! Journal write coordinator.
//!
//! Writes an append-only journal to N replica nodes with per-batch write
//! quorum. A single actor task owns the whole state machine; callers only
//! touch the current batch under a short lock and communicate through a
//! command queue. Records accumulate into batches (flushed on size, count,
//! delay or close); every batch resolves once at least `write_quorum`
//! distinct nodes acknowledged it *and* every earlier batch resolved.
//!
//! A node failing a flush is banned for a while and the current chunk is
//! switched: sealed at its quorum-flushed record count, with all unresolved
//! batches re-enqueued into a freshly created chunk.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use hold_api_types::config::JournalWriterConfig;
use hold_api_types::{ChunkId, ChunkMeta, CHUNK_TYPE_JOURNAL};
use hold_tools::shared_promise::SharedPromise;

use crate::node_client::{DataNodeChannelFactory, DataNodeClient, MasterClient, NodeDescriptor};

struct Batch {
    records: Vec<Bytes>,
    data_size: u64,
    /// Assigned by the actor when the batch is handled.
    first_record_index: AtomicI64,
    flushed: SharedPromise<()>,
    flushed_replicas: AtomicUsize,
}

type BatchRef = Arc<Batch>;

enum Command {
    Batch(BatchRef),
    Close,
    Cancel,
    SwitchChunk(u64),
    FlushResult {
        session_seq: u64,
        node_index: usize,
        batch: BatchRef,
        result: Result<(), Error>,
    },
}

struct BatchBuilder {
    seq: u64,
    records: Vec<Bytes>,
    data_size: u64,
    promise: SharedPromise<()>,
}

struct CurrentBatch {
    error: Option<String>,
    builder: Option<BatchBuilder>,
    /// Promise of the most recently flushed batch.
    last_promise: Option<SharedPromise<()>>,
    next_seq: u64,
}

struct WriterInner {
    config: JournalWriterConfig,
    journal_path: String,
    master: Arc<dyn MasterClient>,
    channels: Arc<dyn DataNodeChannelFactory>,
    command_tx: mpsc::UnboundedSender<Command>,
    current: Mutex<CurrentBatch>,
    opened: SharedPromise<()>,
    closed: SharedPromise<()>,
}

impl WriterInner {
    fn enqueue(&self, command: Command) {
        let _ = self.command_tx.send(command);
    }

    /// Hand the current builder to the actor as a sealed batch.
    fn flush_current(&self, current: &mut CurrentBatch) {
        if let Some(builder) = current.builder.take() {
            current.last_promise = Some(builder.promise.clone());
            let batch = Arc::new(Batch {
                records: builder.records,
                data_size: builder.data_size,
                first_record_index: AtomicI64::new(-1),
                flushed: builder.promise,
                flushed_replicas: AtomicUsize::new(0),
            });
            self.enqueue(Command::Batch(batch));
        }
    }
}

/// Client handle. Dropping it cancels the actor.
pub struct JournalWriter {
    inner: Arc<WriterInner>,
}

impl JournalWriter {
    pub fn new(
        master: Arc<dyn MasterClient>,
        channels: Arc<dyn DataNodeChannelFactory>,
        journal_path: &str,
        config: JournalWriterConfig,
    ) -> Result<Self, Error> {
        if config.write_quorum < 1 || config.write_quorum > config.replication_factor {
            bail!(
                "invalid write quorum {} for replication factor {}",
                config.write_quorum,
                config.replication_factor
            );
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WriterInner {
            config,
            journal_path: journal_path.to_string(),
            master,
            channels,
            command_tx,
            current: Mutex::new(CurrentBatch {
                error: None,
                builder: None,
                last_promise: None,
                next_seq: 0,
            }),
            opened: SharedPromise::new(),
            closed: SharedPromise::new(),
        });

        let actor = Actor {
            inner: Arc::clone(&inner),
            command_rx,
            current_record_index: 0,
            pending_batches: VecDeque::new(),
            closing: false,
            banned: HashMap::new(),
            next_session_seq: 0,
            session: None,
        };
        tokio::spawn(actor.run());

        Ok(Self { inner })
    }

    /// Resolves once the writer is ready to accept records.
    pub async fn open(&self) -> Result<(), Error> {
        self.inner.opened.listen().await
    }

    /// Append records. The returned future resolves when every record of
    /// the call is flushed to a write quorum of replicas.
    pub fn write(&self, records: Vec<Bytes>) -> BoxFuture<'static, Result<(), Error>> {
        let mut current = self.inner.current.lock().unwrap();

        if let Some(message) = &current.error {
            let err = format_err!("{}", message);
            return futures::future::ready(Err(err)).boxed();
        }

        for record in records {
            let builder = self.ensure_builder(&mut current);
            builder.data_size += record.len() as u64;
            builder.records.push(record);

            if builder.records.len() >= self.inner.config.max_batch_record_count
                || builder.data_size >= self.inner.config.max_batch_data_size
            {
                self.inner.flush_current(&mut current);
            }
        }

        // flushes are monotonic, listening on the last batch covers them all
        match (&current.builder, &current.last_promise) {
            (Some(builder), _) => builder.promise.listen().boxed(),
            (None, Some(promise)) => promise.listen().boxed(),
            (None, None) => futures::future::ready(Ok(())).boxed(),
        }
    }

    fn ensure_builder<'a>(&self, current: &'a mut CurrentBatch) -> &'a mut BatchBuilder {
        if current.builder.is_none() {
            let seq = current.next_seq;
            current.next_seq += 1;
            current.builder = Some(BatchBuilder {
                seq,
                records: Vec::new(),
                data_size: 0,
                promise: SharedPromise::new(),
            });

            // batch delay timer
            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.config.max_batch_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    let mut current = inner.current.lock().unwrap();
                    if current.builder.as_ref().map(|b| b.seq) == Some(seq) {
                        inner.flush_current(&mut current);
                    }
                }
            });
        }
        current.builder.as_mut().expect("builder just ensured")
    }

    /// Flush the in-progress batch and shut down once all pending batches
    /// resolved and the last chunk is sealed.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut current = self.inner.current.lock().unwrap();
            self.inner.flush_current(&mut current);
        }
        self.inner.enqueue(Command::Close);
        self.inner.closed.listen().await
    }

    /// Abandon all pending work.
    pub fn cancel(&self) {
        self.inner.enqueue(Command::Cancel);
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct NodeState {
    descriptor: NodeDescriptor,
    client: Arc<dyn DataNodeClient>,
    first_block_index: u32,
    flush_in_progress: bool,
    alive: bool,
    pending: VecDeque<BatchRef>,
    ping_task: Option<JoinHandle<()>>,
}

struct ChunkSession {
    seq: u64,
    chunk_id: ChunkId,
    nodes: Vec<NodeState>,
    record_count: u64,
    data_size: u64,
    flushed_record_count: u64,
}

enum LoopExit {
    Close,
    Switch,
}

struct Actor {
    inner: Arc<WriterInner>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    current_record_index: u64,
    pending_batches: VecDeque<BatchRef>,
    closing: bool,
    banned: HashMap<String, Instant>,
    next_session_seq: u64,
    session: Option<ChunkSession>,
}

impl Actor {
    async fn run(mut self) {
        if let Err(err) = self.guarded_run().await {
            self.fail(err);
        }
    }

    async fn guarded_run(&mut self) -> Result<(), Error> {
        self.open_journal()?;

        loop {
            if self.closing && self.pending_batches.is_empty() && self.session.is_none() {
                break;
            }

            self.open_chunk().await?;
            let exit = self.write_chunk().await?;
            self.close_chunk().await?;

            if matches!(exit, LoopExit::Close) {
                break;
            }
        }

        log::info!("journal writer closed ({})", self.inner.journal_path);
        self.inner.closed.set(Ok(()));
        Ok(())
    }

    fn open_journal(&mut self) -> Result<(), Error> {
        log::info!(
            "journal writer opened ({}, replication {}, write quorum {})",
            self.inner.journal_path,
            self.inner.config.replication_factor,
            self.inner.config.write_quorum
        );
        self.inner.opened.set(Ok(()));
        Ok(())
    }

    fn banned_addresses(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.banned.retain(|address, deadline| {
            if *deadline <= now {
                log::info!("node unbanned ({})", address);
                false
            } else {
                true
            }
        });
        self.banned.keys().cloned().collect()
    }

    fn ban_node(&mut self, address: &str) {
        if !self.banned.contains_key(address) {
            log::info!("node banned ({})", address);
            self.banned.insert(
                address.to_string(),
                Instant::now() + self.inner.config.node_ban_timeout(),
            );
        }
    }

    async fn open_chunk(&mut self) -> Result<(), Error> {
        for _ in 0..self.inner.config.max_chunk_open_attempts.max(1) {
            if self.try_open_chunk().await? {
                return Ok(());
            }
        }
        bail!(
            "all {} attempts to open a journal chunk failed",
            self.inner.config.max_chunk_open_attempts.max(1)
        );
    }

    async fn try_open_chunk(&mut self) -> Result<bool, Error> {
        let forbidden = self.banned_addresses();
        let replication_factor = self.inner.config.replication_factor;
        let write_quorum = self.inner.config.write_quorum;
        let prefer_local_host = self.inner.config.prefer_local_host;

        log::info!("creating journal chunk ({})", self.inner.journal_path);
        let created = self
            .inner
            .master
            .create_journal_chunk(replication_factor, &forbidden, prefer_local_host)
            .await
            .context("error creating journal chunk")?;

        if created.targets.len() < write_quorum {
            bail!(
                "not enough data nodes available: {} received, {} needed for the write quorum",
                created.targets.len(),
                write_quorum
            );
        }

        let chunk_id = created.chunk_id;
        let clients: Vec<Arc<dyn DataNodeClient>> = created
            .targets
            .iter()
            .map(|target| self.inner.channels.create_channel(&target.address))
            .collect();

        log::info!(
            "starting chunk sessions (chunk {}, targets [{}])",
            chunk_id,
            created
                .targets
                .iter()
                .map(|t| t.address.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rpc_timeout = self.inner.config.node_rpc_timeout();
        let starts = futures::future::join_all(created.targets.iter().zip(&clients).map(
            |(target, client)| {
                let client = Arc::clone(client);
                let address = target.address.clone();
                async move {
                    match tokio::time::timeout(rpc_timeout, client.start_chunk(chunk_id)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err((address, err)),
                        Err(_) => Err((address, format_err!("StartChunk timed out"))),
                    }
                }
            },
        ))
        .await;

        let mut start_error = None;
        for result in starts {
            if let Err((address, err)) = result {
                log::warn!("chunk open attempt failed at {} - {:#}", address, err);
                self.ban_node(&address);
                start_error = Some(err);
            }
        }
        if start_error.is_some() {
            return Ok(false);
        }

        log::info!("attaching chunk {} to the journal", chunk_id);
        self.inner
            .master
            .confirm_and_attach(&self.inner.journal_path, chunk_id, &created.targets)
            .await
            .context("error attaching chunk")?;

        let seq = self.next_session_seq;
        self.next_session_seq += 1;

        let nodes = created
            .targets
            .into_iter()
            .zip(clients)
            .map(|(descriptor, client)| {
                let ping_task = self.spawn_ping(Arc::clone(&client), chunk_id);
                NodeState {
                    descriptor,
                    client,
                    first_block_index: 0,
                    flush_in_progress: false,
                    alive: true,
                    pending: VecDeque::new(),
                    ping_task: Some(ping_task),
                }
            })
            .collect();

        self.session = Some(ChunkSession {
            seq,
            chunk_id,
            nodes,
            record_count: 0,
            data_size: 0,
            flushed_record_count: 0,
        });

        // everything not yet quorum-resolved restarts in the new chunk
        let backlog: Vec<BatchRef> = self.pending_batches.iter().cloned().collect();
        for batch in backlog {
            self.enqueue_batch_to_session(&batch);
        }

        log::info!("journal chunk {} opened", chunk_id);
        Ok(true)
    }

    fn spawn_ping(&self, client: Arc<dyn DataNodeClient>, chunk_id: ChunkId) -> JoinHandle<()> {
        let period = self.inner.config.node_ping_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let _ = client.ping_session(chunk_id).await;
            }
        })
    }

    async fn write_chunk(&mut self) -> Result<LoopExit, Error> {
        loop {
            if self.closing && self.pending_batches.is_empty() {
                return Ok(LoopExit::Close);
            }

            let command = match self.command_rx.recv().await {
                Some(command) => command,
                None => bail!("journal writer handle dropped"),
            };

            match command {
                Command::Batch(batch) => {
                    self.handle_batch(batch);
                    if self.is_session_overful() {
                        log::info!("journal chunk is overful, switching");
                        return Ok(LoopExit::Switch);
                    }
                }
                Command::Close => {
                    log::info!("closing journal writer ({})", self.inner.journal_path);
                    self.closing = true;
                }
                Command::Cancel => bail!("journal writer cancelled"),
                Command::SwitchChunk(seq) => {
                    if Some(seq) == self.session.as_ref().map(|s| s.seq) {
                        log::info!("switching journal chunk");
                        return Ok(LoopExit::Switch);
                    }
                }
                Command::FlushResult {
                    session_seq,
                    node_index,
                    batch,
                    result,
                } => self.handle_flush_result(session_seq, node_index, batch, result),
            }
        }
    }

    fn handle_batch(&mut self, batch: BatchRef) {
        let record_count = batch.records.len() as u64;
        batch
            .first_record_index
            .store(self.current_record_index as i64, Ordering::SeqCst);
        log::debug!(
            "records batch ready (records {}-{})",
            self.current_record_index,
            self.current_record_index + record_count - 1
        );
        self.current_record_index += record_count;

        self.pending_batches.push_back(Arc::clone(&batch));
        self.enqueue_batch_to_session(&batch);
    }

    fn enqueue_batch_to_session(&mut self, batch: &BatchRef) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.record_count += batch.records.len() as u64;
        session.data_size += batch.data_size;

        for index in 0..session.nodes.len() {
            session.nodes[index].pending.push_back(Arc::clone(batch));
            Self::maybe_flush_node(&self.inner, session, index);
        }
    }

    fn is_session_overful(&self) -> bool {
        match &self.session {
            Some(session) => {
                session.record_count > self.inner.config.max_chunk_record_count
                    || session.data_size > self.inner.config.max_chunk_data_size
            }
            None => false,
        }
    }

    /// Per node: while idle and the FIFO is non-empty, send the head batch
    /// in one PutBlocks with flush semantics.
    fn maybe_flush_node(inner: &Arc<WriterInner>, session: &mut ChunkSession, node_index: usize) {
        let chunk_id = session.chunk_id;
        let session_seq = session.seq;
        let node = &mut session.nodes[node_index];

        if !node.alive || node.flush_in_progress || node.pending.is_empty() {
            return;
        }

        let batch = match node.pending.pop_front() {
            Some(batch) => batch,
            None => return,
        };
        node.flush_in_progress = true;

        let first_block_index = node.first_block_index;
        let last_block_index = first_block_index + batch.records.len() as u32 - 1;
        log::debug!(
            "flushing journal replica ({}, blocks {}:{}-{})",
            node.descriptor,
            chunk_id,
            first_block_index,
            last_block_index
        );

        let client = Arc::clone(&node.client);
        let records = batch.records.clone();
        let rpc_timeout = inner.config.node_rpc_timeout();
        let command_tx = inner.command_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                rpc_timeout,
                client.put_blocks(chunk_id, first_block_index, records, true),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(format_err!("PutBlocks timed out")),
            };
            let _ = command_tx.send(Command::FlushResult {
                session_seq,
                node_index,
                batch,
                result,
            });
        });
    }

    fn handle_flush_result(
        &mut self,
        session_seq: u64,
        node_index: usize,
        batch: BatchRef,
        result: Result<(), Error>,
    ) {
        let write_quorum = self.inner.config.write_quorum;
        let session = match &mut self.session {
            Some(session) if session.seq == session_seq => session,
            _ => return, // stale result of an abandoned chunk
        };

        let node = &mut session.nodes[node_index];
        node.flush_in_progress = false;

        match result {
            Ok(()) => {
                node.first_block_index += batch.records.len() as u32;
                log::debug!(
                    "journal replica flushed ({}, chunk {})",
                    node.descriptor,
                    session.chunk_id
                );
                batch.flushed_replicas.fetch_add(1, Ordering::SeqCst);

                // batches resolve strictly in order, from the front
                while let Some(front) = self.pending_batches.front() {
                    if front.flushed_replicas.load(Ordering::SeqCst) < write_quorum {
                        break;
                    }
                    let front = self.pending_batches.pop_front().expect("front exists");
                    let record_count = front.records.len() as u64;
                    session.flushed_record_count += record_count;
                    let first = front.first_record_index.load(Ordering::SeqCst);
                    log::debug!(
                        "records flushed by a write quorum (records {}-{})",
                        first,
                        first + record_count as i64 - 1
                    );
                    front.flushed.set(Ok(()));
                }

                Self::maybe_flush_node(&self.inner, session, node_index);
            }
            Err(err) => {
                log::warn!(
                    "journal replica failed ({}, chunk {}) - {:#}",
                    node.descriptor,
                    session.chunk_id,
                    err
                );
                node.alive = false;
                let address = node.descriptor.address.clone();
                self.ban_node(&address);
                self.inner.enqueue(Command::SwitchChunk(session_seq));
            }
        }
    }

    async fn close_chunk(&mut self) -> Result<(), Error> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        // fire-and-forget finish towards the replicas
        log::info!("finishing chunk sessions (chunk {})", session.chunk_id);
        for node in &mut session.nodes {
            if let Some(ping) = node.ping_task.take() {
                ping.abort();
            }
            let client = Arc::clone(&node.client);
            let chunk_id = session.chunk_id;
            let written_block_count = node.first_block_index;
            let address = node.descriptor.address.clone();
            tokio::spawn(async move {
                let meta = ChunkMeta::new(CHUNK_TYPE_JOURNAL, 0);
                if let Err(err) = client
                    .finish_chunk(chunk_id, meta, written_block_count)
                    .await
                {
                    log::warn!("chunk session failed to finish at {} - {:#}", address, err);
                }
            });
        }

        log::info!(
            "sealing chunk (chunk {}, record count {})",
            session.chunk_id,
            session.flushed_record_count
        );
        self.inner
            .master
            .seal_chunk(session.chunk_id, session.flushed_record_count)
            .await
            .context("error sealing chunk")?;
        log::info!("chunk {} sealed", session.chunk_id);

        Ok(())
    }

    /// Terminal failure: store the error, fail every promise in sight and
    /// drain whatever commands are already queued.
    fn fail(&mut self, err: Error) {
        log::warn!("journal writer failed - {:#}", err);
        let message = format!("{:#}", err);

        {
            let mut current = self.inner.current.lock().unwrap();
            current.error = Some(message.clone());
            if let Some(builder) = current.builder.take() {
                builder.promise.set(Err(format_err!("{}", message)));
            }
        }

        self.inner.opened.set(Err(format_err!("{}", message)));
        self.inner.closed.set(Err(format_err!("{}", message)));

        for batch in self.pending_batches.drain(..) {
            batch.flushed.set(Err(format_err!("{}", message)));
        }

        while let Ok(command) = self.command_rx.try_recv() {
            if let Command::Batch(batch) = command {
                batch.flushed.set(Err(format_err!("{}", message)));
            }
        }

        if let Some(mut session) = self.session.take() {
            for node in &mut session.nodes {
                if let Some(ping) = node.ping_task.take() {
                    ping.abort();
                }
            }
        }
    }
}
