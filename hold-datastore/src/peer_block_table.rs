//! Soft map from block id to peers known to hold that block.
//!
//! Used to deflect reads when the node is overloaded. Entries expire by
//! deadline and are dropped lazily; beyond the bound the least recently
//! touched block is evicted.

use std::sync::Mutex;
use std::time::Instant;

use hold_api_types::BlockId;
use hold_tools::lru_cache::LruCache;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub expires_at: Instant,
}

pub struct PeerBlockTable {
    capacity: usize,
    table: Mutex<LruCache<BlockId, Vec<PeerInfo>>>,
}

impl PeerBlockTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            table: Mutex::new(LruCache::new()),
        }
    }

    /// Upsert a peer for a block, keeping the later expiry per address.
    pub fn update_peer(&self, block_id: BlockId, peer: PeerInfo) {
        let mut table = self.table.lock().unwrap();
        match table.get_mut(&block_id) {
            Some(peers) => {
                match peers.iter_mut().find(|known| known.address == peer.address) {
                    Some(known) => known.expires_at = known.expires_at.max(peer.expires_at),
                    None => peers.push(peer),
                }
            }
            None => {
                table.insert(block_id, vec![peer]);
                while table.len() > self.capacity {
                    table.pop_lru();
                }
            }
        }
    }

    /// Current peers of a block; expired entries are dropped on the way.
    pub fn peers(&self, block_id: BlockId) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut table = self.table.lock().unwrap();
        match table.get_mut(&block_id) {
            Some(peers) => {
                peers.retain(|peer| peer.expires_at > now);
                peers.clone()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
