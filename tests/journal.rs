//! Write-quorum journal scenario: a journal writer replicating into real
//! data node services, with the master mocked out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};
use bytes::Bytes;

use hold_api_types::config::{DataNodeConfig, JournalWriterConfig, LocationConfig};
use hold_api_types::{ChunkId, ChunkInfo, ChunkMeta};
use hold_client::{
    CreatedChunk, DataNodeChannelFactory, DataNodeClient, JournalWriter, MasterClient,
    NodeDescriptor,
};
use hold_datastore::{BlockReplicator, RemoteChunkReader};
use holdnode::service::{
    FinishChunkRequest, PingSessionRequest, PutBlocksRequest, StartChunkRequest,
};
use holdnode::{DataNode, DataNodeService};

struct NoRemote;

#[async_trait::async_trait]
impl RemoteChunkReader for NoRemote {
    async fn fetch_meta(&self, _chunk_id: ChunkId) -> Result<ChunkMeta, Error> {
        bail!("no remote reads in this test")
    }
    async fn read_block(&self, _chunk_id: ChunkId, _index: u32) -> Result<Bytes, Error> {
        bail!("no remote reads in this test")
    }
}

struct NoReplicator;

#[async_trait::async_trait]
impl BlockReplicator for NoReplicator {
    async fn replicate_blocks(
        &self,
        _target_address: &str,
        _chunk_id: ChunkId,
        _first_block_index: u32,
        _blocks: Vec<Bytes>,
    ) -> Result<(), Error> {
        bail!("no replication in this test")
    }
}

/// In-process "transport": a DataNodeClient calling straight into a
/// service.
struct LoopbackChannel {
    service: Arc<DataNodeService>,
}

#[async_trait::async_trait]
impl DataNodeClient for LoopbackChannel {
    async fn start_chunk(&self, chunk_id: ChunkId) -> Result<(), Error> {
        self.service.start_chunk(StartChunkRequest { chunk_id }).await
    }

    async fn put_blocks(
        &self,
        chunk_id: ChunkId,
        first_block_index: u32,
        blocks: Vec<Bytes>,
        flush_blocks: bool,
    ) -> Result<(), Error> {
        self.service
            .put_blocks(PutBlocksRequest {
                chunk_id,
                first_block_index,
                blocks,
                enable_caching: false,
                flush_blocks,
            })
            .await
    }

    async fn finish_chunk(
        &self,
        chunk_id: ChunkId,
        meta: ChunkMeta,
        written_block_count: u32,
    ) -> Result<ChunkInfo, Error> {
        let response = self
            .service
            .finish_chunk(FinishChunkRequest {
                chunk_id,
                meta,
                written_block_count,
            })
            .await?;
        Ok(response.chunk_info)
    }

    async fn ping_session(&self, chunk_id: ChunkId) -> Result<(), Error> {
        self.service.ping_session(PingSessionRequest { chunk_id }).await
    }
}

struct TestMaster {
    addresses: Vec<String>,
    next_chunk_index: AtomicUsize,
    sealed: Mutex<Vec<(ChunkId, u64)>>,
}

#[async_trait::async_trait]
impl MasterClient for TestMaster {
    async fn create_journal_chunk(
        &self,
        replication_factor: usize,
        forbidden_addresses: &[String],
        _prefer_local_host: bool,
    ) -> Result<CreatedChunk, Error> {
        let index = self.next_chunk_index.fetch_add(1, Ordering::SeqCst);
        let chunk_id: ChunkId = format!("{:032x}", 0xa000 + index + 1).parse().unwrap();
        let targets: Vec<NodeDescriptor> = self
            .addresses
            .iter()
            .filter(|address| !forbidden_addresses.contains(address))
            .take(replication_factor)
            .map(NodeDescriptor::new)
            .collect();
        Ok(CreatedChunk { chunk_id, targets })
    }

    async fn confirm_and_attach(
        &self,
        _journal_path: &str,
        _chunk_id: ChunkId,
        _replicas: &[NodeDescriptor],
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn seal_chunk(&self, chunk_id: ChunkId, record_count: u64) -> Result<(), Error> {
        self.sealed.lock().unwrap().push((chunk_id, record_count));
        Ok(())
    }
}

struct LoopbackFactory {
    services: HashMap<String, Arc<DataNodeService>>,
}

impl DataNodeChannelFactory for LoopbackFactory {
    fn create_channel(&self, address: &str) -> Arc<dyn DataNodeClient> {
        Arc::new(LoopbackChannel {
            service: Arc::clone(self.services.get(address).unwrap()),
        })
    }
}

fn make_node(dir: &std::path::Path, name: &str) -> Arc<DataNode> {
    let mut store = LocationConfig::new(dir.join(name).join("store"));
    store.low_watermark = 0;
    store.high_watermark = 0;
    let mut cache = LocationConfig::new(dir.join(name).join("cache"));
    cache.low_watermark = 0;
    cache.high_watermark = 0;

    DataNode::bootstrap(
        DataNodeConfig::new(vec![store], cache),
        Arc::new(NoRemote),
        Arc::new(NoReplicator),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_quorum_journal() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let addresses: Vec<String> = (1..=3).map(|i| format!("node{}:9012", i)).collect();

    let mut services = HashMap::new();
    let mut nodes = Vec::new();
    for address in &addresses {
        let node = make_node(dir.path(), &address.replace(':', "-"));
        services.insert(address.clone(), DataNodeService::new(Arc::clone(&node)));
        nodes.push(node);
    }

    let master = Arc::new(TestMaster {
        addresses: addresses.clone(),
        next_chunk_index: AtomicUsize::new(0),
        sealed: Mutex::new(Vec::new()),
    });
    let factory = Arc::new(LoopbackFactory { services });

    let config = JournalWriterConfig {
        replication_factor: 3,
        write_quorum: 2,
        max_batch_delay_ms: 5,
        ..JournalWriterConfig::default()
    };
    let writer = JournalWriter::new(
        Arc::clone(&master) as Arc<dyn MasterClient>,
        factory,
        "//journals/events",
        config,
    )
    .unwrap();

    writer.open().await.unwrap();
    writer
        .write(vec![
            Bytes::from_static(b"record-0"),
            Bytes::from_static(b"record-1"),
        ])
        .await
        .unwrap();
    writer.write(vec![Bytes::from_static(b"record-2")]).await.unwrap();
    writer.close().await.unwrap();

    // the master saw exactly one seal, with the full record count
    let sealed = master.sealed.lock().unwrap().clone();
    assert_eq!(sealed.len(), 1);
    let (chunk_id, record_count) = sealed[0];
    assert_eq!(record_count, 3);

    // FinishChunk is fire-and-forget from the writer's point of view; give
    // the replicas a moment to register their chunks
    for _ in 0..200 {
        if nodes
            .iter()
            .all(|node| node.chunk_store().find_chunk(chunk_id).is_some())
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // at least a write quorum of nodes holds identical byte streams for
    // blocks [0..3); here all replicas were healthy, so all three do
    let expected = b"record-0record-1record-2".to_vec();
    let mut identical = 0;
    for node in &nodes {
        let chunk = match node.chunk_store().find_chunk(chunk_id) {
            Some(chunk) => chunk,
            None => continue,
        };
        assert_eq!(chunk.info().size, expected.len() as u64);
        let path = chunk.location().chunk_file_name(chunk_id);
        if std::fs::read(&path).unwrap() == expected {
            identical += 1;
        }
    }
    assert!(identical >= 2);
    assert_eq!(identical, 3);
}
