//! Configuration of the data node core and the journal writer.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One physical directory on one disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocationConfig {
    pub path: PathBuf,
    /// Advisory byte quota; 0 means unlimited.
    #[serde(default)]
    pub quota: u64,
    /// Below this much available space the location counts as full.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: u64,
    /// Admission margin kept free when accepting new blocks.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u64,
}

fn default_low_watermark() -> u64 {
    1024 * 1024 * 1024
}

fn default_high_watermark() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl LocationConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            quota: 0,
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
        }
    }

    pub fn effective_quota(&self) -> u64 {
        if self.quota == 0 {
            u64::MAX
        } else {
            self.quota
        }
    }
}

/// Configuration of the data node core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataNodeConfig {
    pub store_locations: Vec<LocationConfig>,
    pub cache_location: LocationConfig,

    #[serde(default = "default_max_cached_blocks")]
    pub max_cached_blocks: usize,
    #[serde(default = "default_max_cached_blocks_weight")]
    pub max_cached_blocks_weight: u64,

    #[serde(default = "default_max_cached_readers")]
    pub max_cached_readers: usize,

    #[serde(default = "default_max_cached_chunks")]
    pub max_cached_chunks: usize,
    /// 0 means "use the cache location quota".
    #[serde(default)]
    pub max_cached_chunks_weight: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_read_throttling_size")]
    pub read_throttling_size: u64,
    #[serde(default = "default_write_throttling_size")]
    pub write_throttling_size: u64,

    #[serde(default = "default_peer_update_expiration_ms")]
    pub peer_update_expiration_timeout_ms: u64,
    #[serde(default = "default_peer_update_period_ms")]
    pub peer_update_period_ms: u64,

    /// Prefetch window of the cache download sequential reader.
    #[serde(default = "default_download_prefetch_window")]
    pub download_prefetch_window: usize,

    #[serde(default = "default_health_check_period_ms")]
    pub disk_health_check_period_ms: u64,
}

fn default_max_cached_blocks() -> usize {
    10240
}

fn default_max_cached_blocks_weight() -> u64 {
    512 * 1024 * 1024
}

fn default_max_cached_readers() -> usize {
    256
}

fn default_max_cached_chunks() -> usize {
    1024
}

fn default_session_timeout_ms() -> u64 {
    15_000
}

fn default_read_throttling_size() -> u64 {
    512 * 1024 * 1024
}

fn default_write_throttling_size() -> u64 {
    512 * 1024 * 1024
}

fn default_peer_update_expiration_ms() -> u64 {
    40_000
}

fn default_peer_update_period_ms() -> u64 {
    30_000
}

fn default_download_prefetch_window() -> usize {
    16
}

fn default_health_check_period_ms() -> u64 {
    60_000
}

impl DataNodeConfig {
    pub fn new(store_locations: Vec<LocationConfig>, cache_location: LocationConfig) -> Self {
        Self {
            store_locations,
            cache_location,
            max_cached_blocks: default_max_cached_blocks(),
            max_cached_blocks_weight: default_max_cached_blocks_weight(),
            max_cached_readers: default_max_cached_readers(),
            max_cached_chunks: default_max_cached_chunks(),
            max_cached_chunks_weight: 0,
            session_timeout_ms: default_session_timeout_ms(),
            read_throttling_size: default_read_throttling_size(),
            write_throttling_size: default_write_throttling_size(),
            peer_update_expiration_timeout_ms: default_peer_update_expiration_ms(),
            peer_update_period_ms: default_peer_update_period_ms(),
            download_prefetch_window: default_download_prefetch_window(),
            disk_health_check_period_ms: default_health_check_period_ms(),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn peer_update_period(&self) -> Duration {
        Duration::from_millis(self.peer_update_period_ms)
    }

    pub fn peer_update_expiration_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_update_expiration_timeout_ms)
    }

    pub fn disk_health_check_period(&self) -> Duration {
        Duration::from_millis(self.disk_health_check_period_ms)
    }

    pub fn cached_chunks_weight_limit(&self) -> u64 {
        if self.max_cached_chunks_weight == 0 {
            self.cache_location.effective_quota()
        } else {
            self.max_cached_chunks_weight
        }
    }
}

/// Configuration of the client-side journal write coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JournalWriterConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,

    #[serde(default = "default_max_batch_data_size")]
    pub max_batch_data_size: u64,
    #[serde(default = "default_max_batch_record_count")]
    pub max_batch_record_count: usize,
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,

    #[serde(default = "default_max_chunk_data_size")]
    pub max_chunk_data_size: u64,
    #[serde(default = "default_max_chunk_record_count")]
    pub max_chunk_record_count: u64,
    #[serde(default = "default_max_chunk_open_attempts")]
    pub max_chunk_open_attempts: usize,

    #[serde(default = "default_node_rpc_timeout_ms")]
    pub node_rpc_timeout_ms: u64,
    #[serde(default = "default_node_ping_period_ms")]
    pub node_ping_period_ms: u64,
    #[serde(default = "default_node_ban_timeout_ms")]
    pub node_ban_timeout_ms: u64,

    #[serde(default)]
    pub prefer_local_host: bool,
}

fn default_replication_factor() -> usize {
    3
}

fn default_write_quorum() -> usize {
    2
}

fn default_max_batch_data_size() -> u64 {
    16 * 1024 * 1024
}

fn default_max_batch_record_count() -> usize {
    100_000
}

fn default_max_batch_delay_ms() -> u64 {
    10
}

fn default_max_chunk_data_size() -> u64 {
    512 * 1024 * 1024
}

fn default_max_chunk_record_count() -> u64 {
    1_000_000
}

fn default_max_chunk_open_attempts() -> usize {
    5
}

fn default_node_rpc_timeout_ms() -> u64 {
    15_000
}

fn default_node_ping_period_ms() -> u64 {
    5_000
}

fn default_node_ban_timeout_ms() -> u64 {
    60_000
}

impl Default for JournalWriterConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            write_quorum: default_write_quorum(),
            max_batch_data_size: default_max_batch_data_size(),
            max_batch_record_count: default_max_batch_record_count(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            max_chunk_data_size: default_max_chunk_data_size(),
            max_chunk_record_count: default_max_chunk_record_count(),
            max_chunk_open_attempts: default_max_chunk_open_attempts(),
            node_rpc_timeout_ms: default_node_rpc_timeout_ms(),
            node_ping_period_ms: default_node_ping_period_ms(),
            node_ban_timeout_ms: default_node_ban_timeout_ms(),
            prefer_local_host: false,
        }
    }
}

impl JournalWriterConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn node_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.node_rpc_timeout_ms)
    }

    pub fn node_ping_period(&self) -> Duration {
        Duration::from_millis(self.node_ping_period_ms)
    }

    pub fn node_ban_timeout(&self) -> Duration {
        Duration::from_millis(self.node_ban_timeout_ms)
    }
}
