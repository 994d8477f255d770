//! A location is one physical directory on one disk: it owns the filesystem
//! layout, the per-disk I/O worker queues, space/session accounting and the
//! periodic disk health probe.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use tokio::sync::{oneshot, watch};

use hold_api_types::config::LocationConfig;
use hold_api_types::{CellGuid, ChunkDescriptor, ChunkId, CELL_GUID_FILE_NAME, CHUNK_META_SUFFIX};
use hold_tools::task_queue::{FairShareQueue, TaskQueue};

use crate::chunk_file;

const HEALTH_CHECK_FILE_NAME: &str = "health_check";
const HEALTH_CHECK_PATTERN: &[u8] = b"holdnode disk health probe\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationType {
    Store,
    Cache,
}

#[derive(Debug)]
pub struct Location {
    location_type: LocationType,
    id: String,
    config: LocationConfig,

    enabled: AtomicBool,
    used_space: AtomicI64,
    session_count: AtomicI64,
    chunk_count: AtomicI64,
    cell_guid: Mutex<Option<CellGuid>>,

    write_queue: TaskQueue,
    read_queue: FairShareQueue,
    meta_queue: TaskQueue,

    disabled_tx: watch::Sender<bool>,
    disabled_rx: watch::Receiver<bool>,
}

impl Location {
    pub fn new(location_type: LocationType, id: &str, config: LocationConfig) -> Arc<Self> {
        let (disabled_tx, disabled_rx) = watch::channel(false);
        Arc::new(Self {
            location_type,
            id: id.to_string(),
            write_queue: TaskQueue::new(&format!("{}-write", id)),
            read_queue: FairShareQueue::new(&format!("{}-read", id)),
            meta_queue: TaskQueue::new(&format!("{}-meta", id)),
            config,
            enabled: AtomicBool::new(true),
            used_space: AtomicI64::new(0),
            session_count: AtomicI64::new(0),
            chunk_count: AtomicI64::new(0),
            cell_guid: Mutex::new(None),
            disabled_tx,
            disabled_rx,
        })
    }

    pub fn location_type(&self) -> LocationType {
        self.location_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn write_queue(&self) -> &TaskQueue {
        &self.write_queue
    }

    pub fn read_queue(&self) -> &FairShareQueue {
        &self.read_queue
    }

    pub fn meta_queue(&self) -> &TaskQueue {
        &self.meta_queue
    }

    /// Scan the directory: clean temp files, drop orphaned halves of chunks
    /// and return descriptors of every complete chunk found. Also loads the
    /// cell guid tag file if present.
    pub fn initialize(&self) -> Result<Vec<ChunkDescriptor>, Error> {
        let path = self.path().to_owned();
        log::info!("scanning location '{}' at {:?}", self.id, path);

        std::fs::create_dir_all(&path)
            .map_err(|err| format_err!("unable to create location dir {:?} - {}", path, err))?;

        self.load_cell_guid()?;

        let mut descriptors = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if entry.file_type()?.is_dir() {
                if name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                    self.scan_shard_dir(&entry.path(), &mut descriptors)?;
                }
                continue;
            }

            if name.ends_with(".tmp") {
                log::warn!("removing stale temp file {:?}", entry.path());
                std::fs::remove_file(entry.path())?;
            }
        }

        log::info!(
            "location '{}' scan done, {} chunks found",
            self.id,
            descriptors.len()
        );
        Ok(descriptors)
    }

    fn scan_shard_dir(
        &self,
        shard: &Path,
        descriptors: &mut Vec<ChunkDescriptor>,
    ) -> Result<(), Error> {
        use std::collections::HashMap;

        struct Stem {
            data_size: Option<u64>,
            meta_size: Option<u64>,
        }

        let mut stems: HashMap<ChunkId, Stem> = HashMap::new();

        for entry in std::fs::read_dir(shard)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();

            if name.ends_with(".tmp") {
                log::warn!("removing stale temp file {:?}", entry.path());
                std::fs::remove_file(entry.path())?;
                continue;
            }

            let (stem, is_meta) = match name.strip_suffix(CHUNK_META_SUFFIX) {
                Some(stem) => (stem, true),
                None => (name.as_str(), false),
            };

            let chunk_id: ChunkId = match stem.parse() {
                Ok(id) => id,
                Err(_) => {
                    log::error!("invalid chunk file name {:?}", entry.path());
                    continue;
                }
            };

            let size = entry.metadata()?.len();
            let slot = stems.entry(chunk_id).or_insert(Stem {
                data_size: None,
                meta_size: None,
            });
            if is_meta {
                slot.meta_size = Some(size);
            } else {
                slot.data_size = Some(size);
            }
        }

        for (chunk_id, stem) in stems {
            let data_path = self.chunk_file_name(chunk_id);
            match (stem.data_size, stem.meta_size) {
                (Some(data_size), Some(meta_size)) => {
                    if meta_size == 0 {
                        bail!("chunk {} has an empty meta file", chunk_id);
                    }
                    descriptors.push(ChunkDescriptor {
                        id: chunk_id,
                        disk_size: data_size + meta_size,
                    });
                }
                (Some(_), None) => {
                    log::warn!("missing meta file for {:?}, removing data file", data_path);
                    std::fs::remove_file(&data_path)?;
                }
                (None, Some(_)) => {
                    let meta_path = chunk_file::meta_file_path(&data_path);
                    log::warn!("missing data file for {:?}, removing meta file", meta_path);
                    std::fs::remove_file(&meta_path)?;
                }
                (None, None) => unreachable!(),
            }
        }

        Ok(())
    }

    pub fn chunk_file_name(&self, chunk_id: ChunkId) -> PathBuf {
        self.path()
            .join(chunk_id.shard_name())
            .join(chunk_id.to_string())
    }

    fn load_cell_guid(&self) -> Result<(), Error> {
        let guid_path = self.path().join(CELL_GUID_FILE_NAME);
        match std::fs::read_to_string(&guid_path) {
            Ok(content) => {
                let guid: CellGuid = content
                    .parse()
                    .map_err(|err| format_err!("corrupt cell guid file {:?} - {}", guid_path, err))?;
                *self.cell_guid.lock().unwrap() = Some(guid);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("unable to read cell guid file {:?} - {}", guid_path, err),
        }
    }

    pub fn cell_guid(&self) -> Option<CellGuid> {
        *self.cell_guid.lock().unwrap()
    }

    /// Persist the cell guid tag file and remember the guid.
    pub fn set_cell_guid(&self, guid: CellGuid) -> Result<(), Error> {
        let guid_path = self.path().join(CELL_GUID_FILE_NAME);
        let tmp_path = self.path().join(format!("{}.tmp", CELL_GUID_FILE_NAME));
        std::fs::write(&tmp_path, format!("{}\n", guid))?;
        std::fs::rename(&tmp_path, &guid_path)?;
        *self.cell_guid.lock().unwrap() = Some(guid);
        Ok(())
    }

    /// Free bytes usable for new chunks: filesystem availability capped by
    /// the remaining quota. Re-read from the OS on every call.
    pub fn available_space(&self) -> u64 {
        let fs_available = match nix::sys::statvfs::statvfs(self.path()) {
            Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
            Err(err) => {
                log::error!(
                    "failed to compute available space of location '{}' - {}",
                    self.id,
                    err
                );
                self.disable();
                return 0;
            }
        };

        let remaining_quota = self
            .config
            .effective_quota()
            .saturating_sub(self.used_space());

        fs_available.min(remaining_quota)
    }

    pub fn used_space(&self) -> u64 {
        self.used_space.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn update_used_space(&self, delta: i64) {
        self.used_space.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> i64 {
        self.session_count.load(Ordering::SeqCst)
    }

    pub fn update_session_count(&self, delta: i64) {
        let count = self.session_count.fetch_add(delta, Ordering::SeqCst) + delta;
        log::debug!("location '{}' session count now {}", self.id, count);
    }

    pub fn chunk_count(&self) -> i64 {
        self.chunk_count.load(Ordering::SeqCst)
    }

    pub fn update_chunk_count(&self, delta: i64) {
        self.chunk_count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn is_full(&self) -> bool {
        self.available_space() < self.config.low_watermark
    }

    /// Admission check for `size` more bytes, keeping the high watermark
    /// margin free. A disabled location accepts nothing.
    pub fn has_enough_space(&self, size: u64) -> bool {
        self.is_enabled()
            && self.available_space().saturating_sub(size) >= self.config.high_watermark
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mark the location as failed. Transitions at most once per process
    /// lifetime; the first call fires the disabled notification.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            log::error!("location '{}' at {:?} disabled", self.id, self.path());
            let _ = self.disabled_tx.send(true);
        }
    }

    /// Receiver flipping to `true` when the location gets disabled.
    pub fn on_disabled(&self) -> watch::Receiver<bool> {
        self.disabled_rx.clone()
    }

    /// Delete a chunk's files via the write queue, then fix the location
    /// counters. The deletion is scheduled eagerly; the returned future only
    /// observes completion.
    pub fn schedule_chunk_removal(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        data_size: u64,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);

        self.write_queue.submit(move || {
            log::debug!("removing chunk {} from location '{}'", chunk_id, this.id);
            let data_path = this.chunk_file_name(chunk_id);
            let meta_path = chunk_file::meta_file_path(&data_path);

            let mut result = Ok(());
            for path in [&data_path, &meta_path] {
                if let Err(err) = std::fs::remove_file(path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        result = Err(format_err!("unable to remove {:?} - {}", path, err));
                    }
                }
            }

            if result.is_ok() {
                this.update_chunk_count(-1);
                this.update_used_space(-(data_size as i64));
            }
            let _ = tx.send(result);
        });

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => bail!("chunk removal task dropped"),
            }
        }
    }

    /// Start the periodic disk health probe: write a known pattern to a
    /// sentinel file, read it back, compare. Any deviation disables the
    /// location.
    pub fn start_health_checker(self: &Arc<Self>, period: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !this.is_enabled() {
                    return;
                }
                let probe = Arc::clone(&this);
                let result = this
                    .write_queue
                    .run(move || probe.run_health_probe())
                    .await;
                if let Err(err) = result {
                    log::error!("disk health check of location '{}' failed - {}", this.id, err);
                    this.disable();
                    return;
                }
            }
        });
    }

    fn run_health_probe(&self) -> Result<(), Error> {
        use std::io::Write;

        let probe_path = self.path().join(HEALTH_CHECK_FILE_NAME);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&probe_path)?;
        file.write_all(HEALTH_CHECK_PATTERN)?;
        file.sync_all()?;
        drop(file);

        let read_back = std::fs::read(&probe_path)?;
        if read_back != HEALTH_CHECK_PATTERN {
            bail!("disk health probe read back unexpected content");
        }

        std::fs::remove_file(&probe_path)?;
        Ok(())
    }
}
