//! This crate implements the storage core of a data node.
//!
//! A node owns a set of *store locations* (one directory per disk) holding
//! persistent chunks, plus one *cache location* for chunks fetched from
//! peers. A chunk on disk is a data file named after its id inside a
//! two-hex-digit shard directory, with a `.meta` sidecar carrying the typed
//! extension bag. A data file without a sidecar (or vice versa) is garbage
//! and removed at scan time.
//!
//! Uploads run through write [sessions](session::Session): a windowed
//! sequence of blocks, written to disk strictly in index order, acknowledged
//! per block through flush promises. Reads run through the
//! [block store](block_store::BlockStore): a weight-limited block cache in
//! front of per-location disk readers. Whole-chunk downloads from peers are
//! deduplicated and cached by the [chunk cache](chunk_cache::ChunkCache).

pub mod block_store;
pub mod chunk;
pub mod chunk_cache;
pub mod chunk_file;
pub mod chunk_registry;
pub mod chunk_store;
pub mod location;
pub mod peer_block_table;
pub mod reader_cache;
pub mod remote;
pub mod session;
pub mod session_manager;

pub use block_store::{BlockStore, CachedBlock};
pub use chunk::{Chunk, ChunkEvent, ChunkKind};
pub use chunk_cache::ChunkCache;
pub use chunk_file::{ChunkFileReader, ChunkFileWriter};
pub use chunk_registry::ChunkRegistry;
pub use chunk_store::ChunkStore;
pub use location::{Location, LocationType};
pub use peer_block_table::{PeerBlockTable, PeerInfo};
pub use reader_cache::ReaderCache;
pub use remote::{BlockReplicator, RemoteChunkReader};
pub use session::{Session, SessionState};
pub use session_manager::SessionManager;
