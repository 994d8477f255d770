//! End-to-end scenarios through the data node service surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use bytes::Bytes;

use hold_api_types::config::{DataNodeConfig, LocationConfig};
use hold_api_types::error::{has_code, ErrorCode};
use hold_api_types::{
    BlockId, BlockSizesExt, ChunkId, ChunkMeta, MetaExtension, PartitionSlice, PartitionsExt,
    PARTITIONS_EXT_TAG,
};
use hold_datastore::{BlockReplicator, RemoteChunkReader};
use holdnode::service::{
    FinishChunkRequest, FlushBlockRequest, GetBlocksRequest, GetChunkMetaRequest,
    PeerDescriptor, PingSessionRequest, PrecacheChunkRequest, PutBlocksRequest,
    StartChunkRequest, UpdatePeerRequest,
};
use holdnode::{DataNode, DataNodeService};

struct FakeRemote {
    chunks: std::sync::Mutex<HashMap<ChunkId, Vec<Bytes>>>,
}

impl FakeRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn add(&self, hex: &str, blocks: Vec<&'static [u8]>) -> ChunkId {
        let chunk_id: ChunkId = hex.parse().unwrap();
        self.chunks
            .lock()
            .unwrap()
            .insert(chunk_id, blocks.into_iter().map(Bytes::from_static).collect());
        chunk_id
    }
}

#[async_trait::async_trait]
impl RemoteChunkReader for FakeRemote {
    async fn fetch_meta(&self, chunk_id: ChunkId) -> Result<ChunkMeta, Error> {
        let chunks = self.chunks.lock().unwrap();
        let blocks = chunks
            .get(&chunk_id)
            .ok_or_else(|| format_err!("unknown chunk {}", chunk_id))?;
        let mut meta = ChunkMeta::new(1, 0);
        BlockSizesExt::new(blocks.iter().map(|b| b.len() as u64).collect()).store(&mut meta);
        Ok(meta)
    }

    async fn read_block(&self, chunk_id: ChunkId, index: u32) -> Result<Bytes, Error> {
        let chunks = self.chunks.lock().unwrap();
        let blocks = chunks
            .get(&chunk_id)
            .ok_or_else(|| format_err!("unknown chunk {}", chunk_id))?;
        blocks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| format_err!("no block {}", index))
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

struct Setup {
    service: Arc<DataNodeService>,
    node: Arc<DataNode>,
    remote: Arc<FakeRemote>,
    _dir: tempfile::TempDir,
}

fn location_config(path: std::path::PathBuf) -> LocationConfig {
    let mut config = LocationConfig::new(path);
    config.low_watermark = 0;
    config.high_watermark = 0;
    config
}

fn setup_with(tweak: impl FnOnce(&mut DataNodeConfig)) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut config = DataNodeConfig::new(
        vec![location_config(dir.path().join("store0"))],
        location_config(dir.path().join("cache")),
    );
    tweak(&mut config);

    let remote = FakeRemote::new();
    let node = DataNode::bootstrap(
        config,
        Arc::clone(&remote) as Arc<dyn RemoteChunkReader>,
        Arc::new(NoReplicator),
    )
    .unwrap();
    let service = DataNodeService::new(Arc::clone(&node));

    Setup {
        service,
        node,
        remote,
        _dir: dir,
    }
}

fn setup() -> Setup {
    setup_with(|_| {})
}

fn id(hex: &str) -> ChunkId {
    hex.parse().unwrap()
}

async fn upload_chunk(setup: &Setup, chunk_id: ChunkId, blocks: &[&'static [u8]], meta: ChunkMeta) {
    setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap();
    setup
        .service
        .put_blocks(PutBlocksRequest {
            chunk_id,
            first_block_index: 0,
            blocks: blocks.iter().map(|b| Bytes::from_static(b)).collect(),
            enable_caching: false,
            flush_blocks: false,
        })
        .await
        .unwrap();
    setup
        .service
        .flush_block(FlushBlockRequest {
            chunk_id,
            block_index: blocks.len() as u32 - 1,
        })
        .await
        .unwrap();
    setup
        .service
        .finish_chunk(FinishChunkRequest {
            chunk_id,
            meta,
            written_block_count: blocks.len() as u32,
        })
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_upload() {
    let setup = setup();
    let chunk_id = id("5e000000000000000000000000000001");

    setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap();

    // a second start for the same chunk is rejected
    let err = setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::SessionAlreadyExists));

    setup
        .service
        .put_blocks(PutBlocksRequest {
            chunk_id,
            first_block_index: 0,
            blocks: vec![
                Bytes::from_static(b"aaaa"),
                Bytes::from_static(b"bbb"),
                Bytes::from_static(b"cc"),
            ],
            enable_caching: true,
            flush_blocks: false,
        })
        .await
        .unwrap();

    setup
        .service
        .ping_session(PingSessionRequest { chunk_id })
        .await
        .unwrap();

    setup
        .service
        .flush_block(FlushBlockRequest {
            chunk_id,
            block_index: 2,
        })
        .await
        .unwrap();

    let response = setup
        .service
        .finish_chunk(FinishChunkRequest {
            chunk_id,
            meta: ChunkMeta::new(1, 0),
            written_block_count: 3,
        })
        .await
        .unwrap();
    assert_eq!(response.chunk_info.size, 9);

    // starting again now fails because the chunk exists
    let err = setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::ChunkAlreadyExists));

    // reads are served, from cache and disk alike
    let response = setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id,
            block_indexes: vec![0, 2],
            enable_caching: true,
            peer: None,
        })
        .await
        .unwrap();
    assert!(response.has_complete_chunk);
    assert!(response.blocks[0].data_attached);
    assert_eq!(response.blocks[0].data, Some(Bytes::from_static(b"aaaa")));
    assert_eq!(response.blocks[1].data, Some(Bytes::from_static(b"cc")));

    // a restart scan of the location sees the chunk with that size
    let rescan = hold_datastore::Location::new(
        hold_datastore::LocationType::Store,
        "rescan",
        location_config(setup.node.chunk_store().locations()[0].path().to_owned()),
    );
    let descriptors = rescan.initialize().unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].id, chunk_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_blocks_deflects_under_throttle() {
    let setup = setup_with(|config| config.read_throttling_size = 1000);
    let chunk_id = id("5e000000000000000000000000000002");
    upload_chunk(&setup, chunk_id, &[b"payload"], ChunkMeta::new(1, 0)).await;

    // another node is known to hold block 7
    let block_id = BlockId::new(chunk_id, 7);
    setup.service.update_peer(UpdatePeerRequest {
        peer: PeerDescriptor {
            address: "peer-a:9012".into(),
            expires_at: Instant::now() + Duration::from_secs(60),
        },
        block_ids: vec![block_id],
    });

    // push the node over the read threshold
    setup.service.update_pending_network_out(1001);

    let response = setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id,
            block_indexes: vec![7],
            enable_caching: true,
            peer: Some(PeerDescriptor {
                address: "requester:9012".into(),
                expires_at: Instant::now() + Duration::from_secs(5),
            }),
        })
        .await
        .unwrap();

    assert!(response.has_complete_chunk);
    assert!(!response.blocks[0].data_attached);
    assert_eq!(response.blocks[0].peer_addresses, vec!["peer-a:9012"]);
    // no disk read was scheduled
    assert_eq!(setup.node.block_store().pending_read_size(), 0);

    // the requester was not recorded: no data was attached
    let peers = setup.node.peer_block_table().peers(block_id);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, "peer-a:9012");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_blocks_records_served_peer() {
    let setup = setup();
    let chunk_id = id("5e000000000000000000000000000003");
    upload_chunk(&setup, chunk_id, &[b"block0"], ChunkMeta::new(1, 0)).await;

    setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id,
            block_indexes: vec![0],
            enable_caching: true,
            peer: Some(PeerDescriptor {
                address: "requester:9012".into(),
                expires_at: Instant::now() + Duration::from_secs(5),
            }),
        })
        .await
        .unwrap();

    let peers = setup
        .node
        .peer_block_table()
        .peers(BlockId::new(chunk_id, 0));
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, "requester:9012");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_blocks_missing_chunk_and_failing_block() {
    let setup = setup();

    // entirely unknown chunk: per-block miss, not a request failure
    let missing = id("5e0000000000000000000000000000ff");
    let response = setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id: missing,
            block_indexes: vec![0, 1],
            enable_caching: true,
            peer: None,
        })
        .await
        .unwrap();
    assert!(!response.has_complete_chunk);
    assert!(response.blocks.iter().all(|block| !block.data_attached));

    // existing chunk, out of range block: the request fails as a whole
    let chunk_id = id("5e000000000000000000000000000004");
    upload_chunk(&setup, chunk_id, &[b"only"], ChunkMeta::new(1, 0)).await;
    let err = setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id,
            block_indexes: vec![0, 9],
            enable_caching: true,
            peer: None,
        })
        .await
        .unwrap_err();
    assert!(!has_code(&err, ErrorCode::NoSuchChunk));
    assert_eq!(setup.node.block_store().pending_read_size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_precache_and_read_cached_chunk() {
    let setup = setup();
    let chunk_id = setup
        .remote
        .add("ca000000000000000000000000000001", vec![b"remote", b"bits"]);

    setup
        .service
        .precache_chunk(PrecacheChunkRequest { chunk_id })
        .await
        .unwrap();

    // precaching again is a cheap cache hit
    setup
        .service
        .precache_chunk(PrecacheChunkRequest { chunk_id })
        .await
        .unwrap();
    assert_eq!(setup.node.chunk_cache().chunk_count(), 1);

    // the cached chunk serves block reads; it is not a complete store chunk
    let response = setup
        .service
        .get_blocks(GetBlocksRequest {
            chunk_id,
            block_indexes: vec![1],
            enable_caching: false,
            peer: None,
        })
        .await
        .unwrap();
    assert!(!response.has_complete_chunk);
    assert!(response.blocks[0].data_attached);
    assert_eq!(response.blocks[0].data, Some(Bytes::from_static(b"bits")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_precache_unknown_chunk_fails() {
    let setup = setup();
    let err = setup
        .service
        .precache_chunk(PrecacheChunkRequest {
            chunk_id: id("ca0000000000000000000000000000ff"),
        })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::ChunkPrecachingFailed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_chunk_meta_filtering() {
    let setup = setup();
    let chunk_id = id("5e000000000000000000000000000005");

    let mut meta = ChunkMeta::new(1, 0);
    meta.set_extension(77, Bytes::from_static(b"opaque"));
    meta.set_extension(
        PARTITIONS_EXT_TAG,
        PartitionsExt {
            slices: vec![
                PartitionSlice { partition_tag: 1, row_count: 10, data_size: 100 },
                PartitionSlice { partition_tag: 2, row_count: 20, data_size: 200 },
            ],
        }
        .encode(),
    );
    upload_chunk(&setup, chunk_id, &[b"x"], meta).await;

    // all extensions: the block sizes ext written at close plus ours
    let response = setup
        .service
        .get_chunk_meta(GetChunkMetaRequest {
            chunk_id,
            all_extension_tags: true,
            extension_tags: vec![],
            partition_tag: None,
        })
        .await
        .unwrap();
    assert!(response.meta.find_extension(77).is_some());
    assert!(response.meta.find_extension(PARTITIONS_EXT_TAG).is_some());

    // tag filtered
    let response = setup
        .service
        .get_chunk_meta(GetChunkMetaRequest {
            chunk_id,
            all_extension_tags: false,
            extension_tags: vec![77],
            partition_tag: None,
        })
        .await
        .unwrap();
    assert_eq!(response.meta.extensions.len(), 1);
    assert_eq!(response.meta.extensions[0].tag, 77);

    // partition filtered in place
    let response = setup
        .service
        .get_chunk_meta(GetChunkMetaRequest {
            chunk_id,
            all_extension_tags: true,
            extension_tags: vec![],
            partition_tag: Some(2),
        })
        .await
        .unwrap();
    let ext: &MetaExtension = response.meta.find_extension(PARTITIONS_EXT_TAG).unwrap();
    let partitions = PartitionsExt::decode(&ext.body).unwrap();
    assert_eq!(partitions.slices.len(), 1);
    assert_eq!(partitions.slices[0].partition_tag, 2);

    let err = setup
        .service
        .get_chunk_meta(GetChunkMetaRequest {
            chunk_id: id("5e0000000000000000000000000000fe"),
            all_extension_tags: true,
            extension_tags: vec![],
            partition_tag: None,
        })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::NoSuchChunk));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_expiry_drops_session_and_files() {
    let setup = setup_with(|config| config.session_timeout_ms = 150);
    let chunk_id = id("5e000000000000000000000000000006");

    setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = setup
        .service
        .put_blocks(PutBlocksRequest {
            chunk_id,
            first_block_index: 0,
            blocks: vec![Bytes::from_static(b"late")],
            enable_caching: false,
            flush_blocks: false,
        })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::NoSuchSession));

    let data_path = setup.node.chunk_store().locations()[0].chunk_file_name(chunk_id);
    assert!(!data_path.exists());
    assert!(!data_path.with_extension("meta").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finish_with_wrong_block_count() {
    let setup = setup();
    let chunk_id = id("5e000000000000000000000000000007");

    setup
        .service
        .start_chunk(StartChunkRequest { chunk_id })
        .await
        .unwrap();
    setup
        .service
        .put_blocks(PutBlocksRequest {
            chunk_id,
            first_block_index: 0,
            blocks: vec![Bytes::from_static(b"one")],
            enable_caching: false,
            flush_blocks: true,
        })
        .await
        .unwrap();

    let err = setup
        .service
        .finish_chunk(FinishChunkRequest {
            chunk_id,
            meta: ChunkMeta::new(1, 0),
            written_block_count: 5,
        })
        .await
        .unwrap_err();
    assert!(has_code(&err, ErrorCode::WindowError));
}
