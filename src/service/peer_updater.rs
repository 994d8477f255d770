//! Periodic peer announcements.
//!
//! Every cached block that arrived from a peer remembers its source. This
//! task periodically groups those blocks by source address and tells each
//! source, via a one-way `UpdatePeer`, that this node can serve the blocks
//! for a while. Send failures are logged and forgotten; the entries are
//! soft state on the receiving side anyway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Error;
use async_trait::async_trait;

use hold_api_types::BlockId;

use crate::node::DataNode;
use crate::service::PeerDescriptor;

/// Transport seam for the one-way `UpdatePeer` verb.
#[async_trait]
pub trait PeerUpdateSender: Send + Sync {
    async fn update_peer(
        &self,
        target_address: &str,
        peer: PeerDescriptor,
        block_ids: Vec<BlockId>,
    ) -> Result<(), Error>;
}

pub struct PeerBlockUpdater {
    node: Arc<DataNode>,
    sender: Arc<dyn PeerUpdateSender>,
    local_address: String,
}

impl PeerBlockUpdater {
    pub fn new(
        node: Arc<DataNode>,
        sender: Arc<dyn PeerUpdateSender>,
        local_address: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            sender,
            local_address: local_address.to_string(),
        })
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let period = this.node.config().peer_update_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.update().await;
            }
        })
    }

    pub async fn update(&self) {
        log::debug!("updating peer blocks");
        let expires_at =
            Instant::now() + self.node.config().peer_update_expiration_timeout();

        let mut by_source: HashMap<String, Vec<BlockId>> = HashMap::new();
        for block in self.node.block_store().get_all_blocks() {
            if let Some(source) = block.source() {
                by_source
                    .entry(source.to_string())
                    .or_default()
                    .push(block.block_id());
            }
        }

        for (target_address, block_ids) in by_source {
            log::debug!(
                "sending peer block update to {} ({} blocks)",
                target_address,
                block_ids.len()
            );
            let peer = PeerDescriptor {
                address: self.local_address.clone(),
                expires_at,
            };
            if let Err(err) = self
                .sender
                .update_peer(&target_address, peer, block_ids)
                .await
            {
                log::warn!("peer block update to {} failed - {:#}", target_address, err);
            }
        }
    }
}
