//! End-to-end tests for the syncer
//!
//! The application engine, state provider, and peer transport are mocked;
//! chunk deliveries are driven by a feeder task that answers recorded chunk
//! requests through `Syncer::add_chunk`, the same path the reactor uses.

use async_trait::async_trait;
use kestrel_state_sync::{
    AppInfo, ApplySnapshotChunkRequest, ApplySnapshotChunkResponse, ApplySnapshotChunkResult,
    BlockCommit, Chunk, ChunkQueue, ChunkRequest, ConsensusVersion, OfferSnapshotRequest,
    OfferSnapshotResponse, PeerId, ProviderError, QueryConnection, ReplicatedState, Snapshot,
    SnapshotConnection, SnapshotNetwork, StateProvider, StateSyncConfig, StateSyncError, Syncer,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const P1: PeerId = [1u8; 32];
const P2: PeerId = [2u8; 32];
const APP_VERSION: u64 = 9;

fn snapshot(height: u64, format: u32, chunk_count: u32, hash: &[u8]) -> Snapshot {
    Snapshot {
        height,
        format,
        chunk_count,
        hash: hash.to_vec(),
        metadata: Vec::new(),
        trusted_app_hash: None,
    }
}

fn info_at(height: u64, app_hash: &[u8]) -> AppInfo {
    AppInfo {
        app_version: APP_VERSION,
        last_block_app_hash: app_hash.to_vec(),
        last_block_height: height,
    }
}

#[derive(Default)]
struct MockApp {
    offer_responses: Mutex<VecDeque<OfferSnapshotResponse>>,
    apply_responses: Mutex<HashMap<u32, VecDeque<ApplySnapshotChunkResponse>>>,
    offers: Mutex<Vec<u64>>,
    applied: Mutex<Vec<u32>>,
    info: Mutex<Option<AppInfo>>,
}

impl MockApp {
    fn push_offer_response(&self, response: OfferSnapshotResponse) {
        self.offer_responses.lock().push_back(response);
    }

    fn push_apply_response(&self, index: u32, response: ApplySnapshotChunkResponse) {
        self.apply_responses
            .lock()
            .entry(index)
            .or_default()
            .push_back(response);
    }

    fn set_info(&self, info: AppInfo) {
        *self.info.lock() = Some(info);
    }

    fn offers(&self) -> Vec<u64> {
        self.offers.lock().clone()
    }

    fn applied(&self) -> Vec<u32> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl SnapshotConnection for MockApp {
    async fn offer_snapshot(
        &self,
        request: OfferSnapshotRequest,
    ) -> Result<OfferSnapshotResponse, String> {
        self.offers.lock().push(request.snapshot.height);
        Ok(self
            .offer_responses
            .lock()
            .pop_front()
            .unwrap_or(OfferSnapshotResponse::Accept))
    }

    async fn apply_snapshot_chunk(
        &self,
        request: ApplySnapshotChunkRequest,
    ) -> Result<ApplySnapshotChunkResponse, String> {
        self.applied.lock().push(request.index);
        let scripted = self
            .apply_responses
            .lock()
            .get_mut(&request.index)
            .and_then(|responses| responses.pop_front());
        Ok(scripted.unwrap_or_else(|| ApplySnapshotChunkResult::Accept.into()))
    }
}

#[async_trait]
impl QueryConnection for MockApp {
    async fn info(&self) -> Result<AppInfo, String> {
        self.info
            .lock()
            .clone()
            .ok_or_else(|| "no info configured".to_string())
    }
}

#[derive(Default)]
struct MockProvider {
    app_hashes: HashMap<u64, Vec<u8>>,
    states: HashMap<u64, ReplicatedState>,
    commits: HashMap<u64, BlockCommit>,
    no_witnesses: bool,
}

impl MockProvider {
    fn new() -> Self {
        Self::default()
    }

    fn with_height(mut self, height: u64, app_hash: &[u8]) -> Self {
        self.app_hashes.insert(height, app_hash.to_vec());
        self.states.insert(
            height,
            ReplicatedState {
                height,
                app_hash: app_hash.to_vec(),
                consensus: ConsensusVersion {
                    block: 11,
                    app: APP_VERSION,
                },
            },
        );
        self.commits.insert(
            height,
            BlockCommit {
                height,
                block_hash: [height as u8; 32],
            },
        );
        self
    }
}

#[async_trait]
impl StateProvider for MockProvider {
    async fn app_hash(&self, height: u64) -> Result<Vec<u8>, ProviderError> {
        if self.no_witnesses {
            return Err(ProviderError::NoWitnesses);
        }
        self.app_hashes
            .get(&height)
            .cloned()
            .ok_or_else(|| ProviderError::Fetch(format!("no app hash at height {}", height)))
    }

    async fn state(&self, height: u64) -> Result<ReplicatedState, ProviderError> {
        self.states
            .get(&height)
            .cloned()
            .ok_or_else(|| ProviderError::Fetch(format!("no state at height {}", height)))
    }

    async fn commit(&self, height: u64) -> Result<BlockCommit, ProviderError> {
        self.commits
            .get(&height)
            .cloned()
            .ok_or_else(|| ProviderError::Fetch(format!("no commit at height {}", height)))
    }
}

#[derive(Default)]
struct MockNetwork {
    chunk_requests: Mutex<Vec<(PeerId, ChunkRequest)>>,
    snapshot_requests: Mutex<Vec<PeerId>>,
}

impl MockNetwork {
    fn drain_chunk_requests(&self) -> Vec<(PeerId, ChunkRequest)> {
        std::mem::take(&mut *self.chunk_requests.lock())
    }
}

impl SnapshotNetwork for MockNetwork {
    fn request_snapshots(&self, peer: PeerId) {
        self.snapshot_requests.lock().push(peer);
    }

    fn request_chunk(&self, peer: PeerId, request: ChunkRequest) {
        self.chunk_requests.lock().push((peer, request));
    }
}

type TestSyncer = Syncer<MockApp, MockApp, MockProvider, MockNetwork>;

struct Harness {
    syncer: Arc<TestSyncer>,
    app: Arc<MockApp>,
    network: Arc<MockNetwork>,
    temp: tempfile::TempDir,
}

fn harness(config: StateSyncConfig, provider: MockProvider) -> Harness {
    let app = Arc::new(MockApp::default());
    let network = Arc::new(MockNetwork::default());
    let temp = tempfile::tempdir().unwrap();
    let syncer = Arc::new(Syncer::new(
        config,
        Arc::clone(&app),
        Arc::clone(&app),
        Arc::new(provider),
        Arc::clone(&network),
        temp.path(),
    ));
    Harness {
        syncer,
        app,
        network,
        temp,
    }
}

/// Answer recorded chunk requests with the given payloads. A `None` payload
/// means the chunk is never served.
fn serve_chunks(
    syncer: Arc<TestSyncer>,
    network: Arc<MockNetwork>,
    payloads: Vec<Option<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for (peer, request) in network.drain_chunk_requests() {
                if let Some(Some(data)) = payloads.get(request.index as usize) {
                    let chunk = Chunk {
                        height: request.height,
                        format: request.format,
                        index: request.index,
                        data: data.clone(),
                        sender: peer,
                    };
                    let _ = syncer.add_chunk(chunk);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

#[tokio::test]
async fn test_sync_any_restores_best_snapshot() {
    let provider = MockProvider::new().with_height(100, &[0xDE, 0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xDE, 0xAD]));

    let snap = snapshot(100, 1, 3, &[0xAA]);
    assert!(h.syncer.add_snapshot(P1, snap.clone()).unwrap());
    assert!(!h.syncer.add_snapshot(P2, snap.clone()).unwrap());

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![
            Some(b"a".to_vec()),
            Some(b"b".to_vec()),
            Some(b"c".to_vec()),
        ],
    );
    let (state, commit) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    assert_eq!(state.height, 100);
    assert_eq!(state.app_hash, vec![0xDE, 0xAD]);
    assert_eq!(commit.height, 100);

    // Exactly one offer, chunks applied in ascending order.
    assert_eq!(h.app.offers(), vec![100]);
    assert_eq!(h.app.applied(), vec![0, 1, 2]);

    // All chunk staging was cleaned up.
    assert_eq!(std::fs::read_dir(h.temp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_single_chunk_snapshot() {
    let provider = MockProvider::new().with_height(100, &[0x01]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0x01]));
    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 1, &[0xAA]))
        .unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"only".to_vec())],
    );
    let (state, _) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    assert_eq!(state.height, 100);
    assert_eq!(h.app.applied(), vec![0]);
}

#[tokio::test]
async fn test_format_rejection_moves_to_next_candidate() {
    let provider = MockProvider::new()
        .with_height(100, &[0x64])
        .with_height(99, &[0x63]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.push_offer_response(OfferSnapshotResponse::RejectFormat);
    h.app.push_offer_response(OfferSnapshotResponse::Accept);
    h.app.set_info(info_at(99, &[0x63]));

    h.syncer
        .add_snapshot(P1, snapshot(100, 2, 1, &[0xBB]))
        .unwrap();
    h.syncer
        .add_snapshot(P1, snapshot(99, 1, 1, &[0xCC]))
        .unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec())],
    );
    let (state, commit) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    // The format-2 candidate was offered first and burned the whole format.
    assert_eq!(h.app.offers(), vec![100, 99]);
    assert_eq!(state.height, 99);
    assert_eq!(commit.height, 99);

    // The rejection is permanent, even for future snapshots.
    assert!(!h
        .syncer
        .add_snapshot(P2, snapshot(101, 2, 1, &[0xDD]))
        .unwrap());
}

#[tokio::test]
async fn test_sender_rejection_blacklists_advertisers() {
    let provider = MockProvider::new().with_height(50, &[0x32]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.push_offer_response(OfferSnapshotResponse::RejectSender);

    let snap = snapshot(50, 1, 1, &[0xDD]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();
    h.syncer.add_snapshot(P2, snap.clone()).unwrap();

    let err = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap_err();
    assert!(matches!(err, StateSyncError::NoSnapshots));

    // Both advertisers are blacklisted and the pool has run dry.
    assert!(h.syncer.snapshot_pool().get_peers(&snap).is_empty());
    assert!(h.syncer.snapshot_pool().best().is_none());
    assert!(!h.syncer.add_snapshot(P1, snapshot(51, 1, 1, &[0xEE])).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_chunk_delivery_stall_times_out() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xAD]));

    let snap = snapshot(100, 1, 2, &[0xAA]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();
    let queue = Arc::new(ChunkQueue::new(&snap, h.temp.path()).unwrap());

    // Chunk 1 is never served.
    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec()), None],
    );
    let err = h.syncer.sync(&snap, Arc::clone(&queue)).await.unwrap_err();
    feeder.abort();

    assert!(matches!(err, StateSyncError::ChunkTimeout));
    assert_eq!(h.app.applied(), vec![0]);
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn test_chunk_timeout_rejects_snapshot_in_pool() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xAD]));
    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 2, &[0xAA]))
        .unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec()), None],
    );
    let err = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap_err();
    feeder.abort();

    // The stalled snapshot was rejected, leaving the pool empty.
    assert!(matches!(err, StateSyncError::NoSnapshots));
    assert!(h.syncer.snapshot_pool().best().is_none());
    assert_eq!(std::fs::read_dir(h.temp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_retry_snapshot_keeps_progress() {
    let provider = MockProvider::new().with_height(100, &[0xDE]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xDE]));
    h.app
        .push_apply_response(1, ApplySnapshotChunkResult::RetrySnapshot.into());

    let snap = snapshot(100, 1, 3, &[0xAA]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();
    h.syncer.add_snapshot(P2, snap.clone()).unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![
            Some(b"a".to_vec()),
            Some(b"b".to_vec()),
            Some(b"c".to_vec()),
        ],
    );
    let (state, _) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    assert_eq!(state.height, 100);
    // The snapshot was re-offered and restoration restarted from chunk 0
    // with already-delivered payloads preserved.
    assert_eq!(h.app.offers(), vec![100, 100]);
    assert_eq!(h.app.applied(), vec![0, 1, 0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_app_retry_refetches_single_chunk() {
    let provider = MockProvider::new().with_height(100, &[0xDE]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xDE]));
    h.app
        .push_apply_response(1, ApplySnapshotChunkResult::Retry.into());

    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 3, &[0xAA]))
        .unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![
            Some(b"a".to_vec()),
            Some(b"b".to_vec()),
            Some(b"c".to_vec()),
        ],
    );
    let (state, _) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    assert_eq!(state.height, 100);
    // Chunk 1 was refetched and resubmitted; everything else applied once.
    assert_eq!(h.app.applied(), vec![0, 1, 1, 2]);
}

#[tokio::test]
async fn test_reject_senders_response_blacklists_peer() {
    let provider = MockProvider::new().with_height(100, &[0xDE]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xDE]));
    h.app.push_apply_response(
        0,
        ApplySnapshotChunkResponse {
            result: ApplySnapshotChunkResult::Accept,
            refetch_chunks: Vec::new(),
            reject_senders: vec![P2],
        },
    );

    let snap = snapshot(100, 1, 2, &[0xAA]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();
    h.syncer.add_snapshot(P2, snap.clone()).unwrap();

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec()), Some(b"b".to_vec())],
    );
    let (state, _) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
    feeder.abort();

    assert_eq!(state.height, 100);
    assert_eq!(h.syncer.snapshot_pool().get_peers(&snap), vec![P1]);
    assert!(!h.syncer.add_snapshot(P2, snapshot(101, 1, 1, &[0xBB])).unwrap());
}

#[tokio::test]
async fn test_verify_failure_surfaces() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    // The engine reports height 99 after restoring a height-100 snapshot.
    h.app.set_info(info_at(99, &[0xAD]));

    let snap = snapshot(100, 1, 1, &[0xAA]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();
    let queue = Arc::new(ChunkQueue::new(&snap, h.temp.path()).unwrap());

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec())],
    );
    let err = h.syncer.sync(&snap, Arc::clone(&queue)).await.unwrap_err();
    feeder.abort();

    assert!(matches!(
        err,
        StateSyncError::VerifyFailed(ref message) if message.contains("height")
    ));
    queue.close();
}

#[tokio::test]
async fn test_abort_terminates_sync() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.push_offer_response(OfferSnapshotResponse::Abort);
    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 1, &[0xAA]))
        .unwrap();

    let err = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap_err();
    assert!(matches!(err, StateSyncError::Aborted));

    // Aborting is not a rejection; the snapshot stays in the pool.
    assert!(h.syncer.snapshot_pool().best().is_some());
}

#[tokio::test]
async fn test_no_witnesses_surfaces() {
    let mut provider = MockProvider::new().with_height(100, &[0xAD]);
    provider.no_witnesses = true;
    let h = harness(StateSyncConfig::default(), provider);
    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 1, &[0xAA]))
        .unwrap();

    let err = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap_err();
    assert!(matches!(err, StateSyncError::NoWitnesses));
}

#[tokio::test]
async fn test_provider_failure_rejects_snapshot() {
    // The provider has no data for the snapshot height.
    let provider = MockProvider::new();
    let h = harness(StateSyncConfig::default(), provider);
    h.syncer
        .add_snapshot(P1, snapshot(100, 1, 1, &[0xAA]))
        .unwrap();

    let err = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap_err();
    assert!(matches!(err, StateSyncError::NoSnapshots));
    assert!(h.syncer.snapshot_pool().best().is_none());
}

#[tokio::test]
async fn test_fetcher_count_does_not_change_apply_order() {
    for chunk_fetchers in [1u32, 16] {
        let provider = MockProvider::new().with_height(100, &[0xAD]);
        let config = StateSyncConfig {
            chunk_fetchers,
            ..StateSyncConfig::default()
        };
        let h = harness(config, provider);
        h.app.set_info(info_at(100, &[0xAD]));
        h.syncer
            .add_snapshot(P1, snapshot(100, 1, 5, &[0xAA]))
            .unwrap();

        let feeder = serve_chunks(
            Arc::clone(&h.syncer),
            Arc::clone(&h.network),
            (0..5).map(|i| Some(vec![i as u8])).collect(),
        );
        let (state, _) = h.syncer.sync_any(Duration::ZERO, || {}).await.unwrap();
        feeder.abort();

        assert_eq!(state.height, 100);
        assert_eq!(h.app.applied(), vec![0, 1, 2, 3, 4]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovery_waits_for_snapshots() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xAD]));

    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec())],
    );

    // The pool starts empty; the snapshot only shows up once the retry hook
    // re-broadcasts discovery.
    let syncer = Arc::clone(&h.syncer);
    let mut hook_calls = 0u32;
    let (state, _) = h
        .syncer
        .sync_any(Duration::from_secs(10), || {
            hook_calls += 1;
            let _ = syncer.add_snapshot(P1, snapshot(100, 1, 1, &[0xAA]));
        })
        .await
        .unwrap();
    feeder.abort();

    assert_eq!(hook_calls, 1);
    assert_eq!(state.height, 100);
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let provider = MockProvider::new().with_height(100, &[0xAD]);
    let h = harness(StateSyncConfig::default(), provider);
    h.app.set_info(info_at(100, &[0xAD]));

    let snap = snapshot(100, 1, 1, &[0xAA]);
    h.syncer.add_snapshot(P1, snap.clone()).unwrap();

    // The first sync blocks waiting for its chunk.
    let first_queue = Arc::new(ChunkQueue::new(&snap, h.temp.path()).unwrap());
    let first = tokio::spawn({
        let syncer = Arc::clone(&h.syncer);
        let snap = snap.clone();
        let queue = Arc::clone(&first_queue);
        async move { syncer.sync(&snap, queue).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second_queue = Arc::new(ChunkQueue::new(&snap, h.temp.path()).unwrap());
    let err = h
        .syncer
        .sync(&snap, Arc::clone(&second_queue))
        .await
        .unwrap_err();
    assert!(matches!(err, StateSyncError::AlreadyInProgress));

    // Unblock and finish the first sync.
    let feeder = serve_chunks(
        Arc::clone(&h.syncer),
        Arc::clone(&h.network),
        vec![Some(b"a".to_vec())],
    );
    let (state, _) = first.await.unwrap().unwrap();
    feeder.abort();
    assert_eq!(state.height, 100);

    first_queue.close();
    second_queue.close();
}

#[tokio::test]
async fn test_add_chunk_without_sync_in_progress() {
    let h = harness(StateSyncConfig::default(), MockProvider::new());
    let err = h
        .syncer
        .add_chunk(Chunk {
            height: 100,
            format: 1,
            index: 0,
            data: b"a".to_vec(),
            sender: P1,
        })
        .unwrap_err();
    assert!(matches!(err, StateSyncError::NoSyncInProgress));
}

#[tokio::test]
async fn test_add_peer_requests_snapshots() {
    let h = harness(StateSyncConfig::default(), MockProvider::new());
    h.syncer.add_peer(P1);
    assert_eq!(h.network.snapshot_requests.lock().clone(), vec![P1]);
}
