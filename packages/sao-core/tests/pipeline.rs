//! Upload and download through real workers, with every node in-process.
//!
//! Workers are `ProcNode`s registered in a `StaticDirectory`; all chunk
//! pulls go through one `LoopbackTransport` that maps each node's advertised
//! URLs onto its staging directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sao_core::config::PeerOrder;
use sao_core::crypto::SEAL_OVERHEAD;
use sao_core::network::{
    FileDecryptRequest, FileDecryptResponse, FileEncryptRequest, FileEncryptResponse,
    PeerChannel, StaticDirectory,
};
use sao_core::storage::{
    validate_layout, ChunkMetadata, Database, FileCatalog, FileRecord, MemoryKeyStore,
    SqliteCatalog,
};
use sao_core::store::{LocalObjectStore, ObjectReader, ObjectStore, RetryPolicy};
use sao_core::transfer::LoopbackTransport;
use sao_core::{Context, Error, ProcNode, ProcSettings, StoreRequest, StoreService, StoreSettings};
use tokio::io::AsyncReadExt;

const ORCHESTRATOR: &str = "http://orchestrator";
const MIB: u64 = 1024 * 1024;

struct Cluster {
    root: tempfile::TempDir,
    transport: Arc<LoopbackTransport>,
    directory: Arc<StaticDirectory>,
    catalog: Arc<SqliteCatalog>,
    store: StoreService,
}

impl Cluster {
    fn new(trusted: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let stage = root.path().join("store");
        let transport = Arc::new(LoopbackTransport::new());
        transport.mount(format!("{}/api/v1/proc/file", ORCHESTRATOR), &stage);

        let directory = Arc::new(StaticDirectory::new());
        let catalog = Arc::new(SqliteCatalog::new(Database::open_in_memory().unwrap()));
        let objects = LocalObjectStore::new(root.path().join("objects")).unwrap();

        let store = StoreService::new(
            store_settings(root.path(), trusted),
            Arc::new(objects),
            catalog.clone(),
            transport.clone(),
            directory.clone(),
        )
        .unwrap();

        Self {
            root,
            transport,
            directory,
            catalog,
            store,
        }
    }

    fn objects(&self) -> PathBuf {
        self.root.path().join("objects")
    }

    fn cache(&self) -> PathBuf {
        self.root.path().join("cache")
    }

    /// Start a worker named `peer_id` and make it reachable
    fn add_worker(&self, peer_id: &str) -> Arc<ProcNode> {
        let stage = self.root.path().join(peer_id);
        let base = format!("http://{}", peer_id);
        self.transport
            .mount(format!("{}/api/v1/proc/encrypt", base), &stage);
        self.transport
            .mount(format!("{}/api/v1/proc/decrypt", base), &stage);

        let settings = ProcSettings {
            stage_dir: stage,
            advertised_base: base,
            max_transfer_duration: Duration::from_secs(30),
            request_deadline: Duration::from_secs(30),
        };
        let worker = Arc::new(
            ProcNode::new(
                settings,
                Arc::new(MemoryKeyStore::new(peer_id)),
                self.transport.clone(),
            )
            .unwrap(),
        );
        self.directory.insert(worker.clone());
        worker
    }

    async fn upload(&self, data: &[u8], price: u64) -> sao_core::Result<FileRecord> {
        upload_to(&self.store, None, data, price).await
    }

    async fn download(&self, file_id: &str) -> sao_core::Result<Vec<u8>> {
        let (_, mut reader) = self.store.get_file(&Context::background(), file_id).await?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }
}

fn store_settings(root: &Path, trusted: &[&str]) -> StoreSettings {
    StoreSettings {
        part_count: 2,
        chunk_threshold: MIB,
        retry: RetryPolicy {
            max_attempts: 3,
            order: PeerOrder::Configured,
        },
        chunk_concurrency: 2,
        advertised_base: ORCHESTRATOR.into(),
        stage_dir: root.join("store"),
        cache_dir: root.join("cache"),
        trusted_peers: trusted.iter().map(|p| p.to_string()).collect(),
        max_transfer_duration: Duration::from_secs(30),
    }
}

async fn upload_to(
    store: &StoreService,
    file_id: Option<&str>,
    data: &[u8],
    price: u64,
) -> sao_core::Result<FileRecord> {
    let request = StoreRequest {
        file_id: file_id.map(str::to_string),
        filename: "report.bin".into(),
        content_type: "application/octet-stream".into(),
        size: data.len() as u64,
        price,
        client_id: "client-1".into(),
    };
    let reader: ObjectReader = Box::new(std::io::Cursor::new(data.to_vec()));
    store.store_file(&Context::background(), reader, request).await
}

/// A trusted peer that declines everything it is asked
struct Refusing {
    id: String,
    asked: AtomicUsize,
}

#[async_trait]
impl PeerChannel for Refusing {
    fn peer_id(&self) -> String {
        self.id.clone()
    }

    async fn encrypt(
        &self,
        _ctx: &Context,
        _request: FileEncryptRequest,
    ) -> sao_core::Result<FileEncryptResponse> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(FileEncryptResponse::rejected())
    }

    async fn decrypt(
        &self,
        _ctx: &Context,
        _request: FileDecryptRequest,
    ) -> sao_core::Result<FileDecryptResponse> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(FileDecryptResponse::rejected())
    }
}

/// A custodian whose network service has gone away
struct Stopped {
    id: String,
}

#[async_trait]
impl PeerChannel for Stopped {
    fn peer_id(&self) -> String {
        self.id.clone()
    }

    async fn encrypt(
        &self,
        _ctx: &Context,
        _request: FileEncryptRequest,
    ) -> sao_core::Result<FileEncryptResponse> {
        Err(Error::Transport("network service stopped".into()))
    }

    async fn decrypt(
        &self,
        _ctx: &Context,
        _request: FileDecryptRequest,
    ) -> sao_core::Result<FileDecryptResponse> {
        Err(Error::Transport("network service stopped".into()))
    }
}

/// A catalog that can be read but refuses every write
struct ReadOnlyCatalog;

impl FileCatalog for ReadOnlyCatalog {
    fn put_file(&self, _record: &FileRecord) -> sao_core::Result<()> {
        Err(Error::Database("database is read-only".into()))
    }

    fn put_file_with_layout(
        &self,
        _record: &FileRecord,
        _layout: &[ChunkMetadata],
    ) -> sao_core::Result<()> {
        Err(Error::Database("database is read-only".into()))
    }

    fn file(&self, _file_id: &str) -> sao_core::Result<Option<FileRecord>> {
        Ok(None)
    }

    fn delete_file(&self, _file_id: &str) -> sao_core::Result<bool> {
        Err(Error::Database("database is read-only".into()))
    }

    fn store_chunk_metadata(&self, _file_id: &str, _layout: &[ChunkMetadata]) -> sao_core::Result<()> {
        Err(Error::Database("database is read-only".into()))
    }

    fn chunk_metadata(&self, _file_id: &str) -> sao_core::Result<Vec<ChunkMetadata>> {
        Ok(Vec::new())
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_ten_megabyte_upload_layout() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let data = pattern(10 * MIB as usize);

    let record = cluster.upload(&data, 5).await.unwrap();
    assert!(record.encrypted);
    assert_eq!(record.size, 10 * MIB);

    let layout = cluster.catalog.chunk_metadata(&record.file_id).unwrap();
    assert_eq!(layout.len(), 2);

    let c0 = 5 * MIB + SEAL_OVERHEAD;
    let c1 = 5 * MIB + SEAL_OVERHEAD;
    assert_eq!(layout[0].plaintext_size, 5 * MIB);
    assert_eq!(layout[1].plaintext_size, 5 * MIB);
    assert_eq!((layout[0].cipher_offset, layout[0].cipher_size), (0, c0));
    assert_eq!((layout[1].cipher_offset, layout[1].cipher_size), (c0, c1));
    assert!(layout
        .iter()
        .all(|chunk| chunk.custodian.as_deref() == Some("worker-a")));

    // The stored blob is exactly the concatenated sealed chunks
    let object = cluster.objects().join(&record.content_address);
    assert_eq!(std::fs::metadata(object).unwrap().len(), c0 + c1);
}

#[tokio::test]
async fn test_layout_covers_ciphertext() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let data = pattern(1_000_003);

    let record = cluster.upload(&data, 1).await.unwrap();
    let layout = cluster.catalog.chunk_metadata(&record.file_id).unwrap();

    let total = validate_layout(&layout).unwrap();
    let mut end = 0;
    for chunk in &layout {
        assert_eq!(chunk.cipher_offset, end);
        end += chunk.cipher_size;
    }
    assert_eq!(end, total);
    assert_eq!(total, data.len() as u64 + layout.len() as u64 * SEAL_OVERHEAD);
}

#[tokio::test]
async fn test_download_round_trip() {
    let cluster = Cluster::new(&["worker-a", "worker-b"]);
    cluster.add_worker("worker-a");
    cluster.add_worker("worker-b");
    let data = pattern(3 * MIB as usize + 17);

    let record = cluster.upload(&data, 9).await.unwrap();
    assert_eq!(cluster.download(&record.file_id).await.unwrap(), data);

    // Second download is served from the cached plaintext
    assert_eq!(cluster.download(&record.file_id).await.unwrap(), data);

    // Nothing is left in the served stage; the plaintext sits in the cache
    assert!(files_in(cluster.store.stage_dir()).is_empty());
    let cached = files_in(&cluster.cache());
    assert_eq!(cached.len(), 1, "{:?}", cached);
    assert!(cached[0].to_string_lossy().ends_with(".original"));
}

#[tokio::test]
async fn test_upload_cleans_stage() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");

    cluster.upload(&pattern(4096), 1).await.unwrap();

    assert!(files_in(cluster.store.stage_dir()).is_empty());
}

#[tokio::test]
async fn test_repeated_encrypt_is_idempotent() {
    let cluster = Cluster::new(&["worker-a"]);
    let worker = cluster.add_worker("worker-a");

    let data = vec![4u8; 2048];
    let chunk = cluster.store.stage_dir().join("manual_0");
    std::fs::create_dir_all(cluster.store.stage_dir()).unwrap();
    std::fs::write(&chunk, &data).unwrap();
    let request = FileEncryptRequest {
        file_id: "manual".into(),
        client_id: "client-1".into(),
        offset: 0,
        size: data.len() as u64,
        transfer: sao_core::transfer::http_descriptor(
            format!("{}/api/v1/proc/file/manual_0", ORCHESTRATOR),
            data.len() as u64,
        )
        .unwrap(),
    };

    let first = worker
        .handle_encrypt(&Context::background(), request.clone())
        .await;
    let sealed = worker.stage_dir().join("manual_0.encrypt");
    let first_bytes = std::fs::read(&sealed).unwrap();

    // The source is gone, so a second transfer would fail
    std::fs::remove_file(&chunk).unwrap();
    let second = worker.handle_encrypt(&Context::background(), request).await;

    assert!(first.accepted && second.accepted);
    assert_eq!(first.file_key, second.file_key);
    assert_eq!(std::fs::read(&sealed).unwrap(), first_bytes);
}

#[tokio::test]
async fn test_decrypt_exhaustion_fails_without_output() {
    let cluster = Cluster::new(&["worker-a", "worker-b"]);
    cluster.add_worker("worker-a");
    let data = pattern(100_000);
    let record = cluster.upload(&data, 3).await.unwrap();

    // The custodian leaves, a worker without the keys remains
    cluster.directory.remove("worker-a");
    cluster.add_worker("worker-b");

    let result = cluster.download(&record.file_id).await;
    assert!(matches!(result, Err(Error::NoEligiblePeer(_))), "{:?}", result.err());
    assert!(files_in(cluster.store.stage_dir()).is_empty());
}

#[tokio::test]
async fn test_decrypt_with_no_peers_fails() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let record = cluster.upload(&pattern(10_000), 3).await.unwrap();

    cluster.directory.remove("worker-a");

    assert!(matches!(
        cluster.download(&record.file_id).await,
        Err(Error::NoEligiblePeer(_))
    ));
}

#[tokio::test]
async fn test_free_file_skips_workers() {
    let cluster = Cluster::new(&[]);
    let data = b"hello world".to_vec();

    let record = cluster.upload(&data, 0).await.unwrap();

    assert!(!record.encrypted);
    assert_eq!(
        record.content_address,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert!(cluster.catalog.chunk_metadata(&record.file_id).unwrap().is_empty());
    assert_eq!(cluster.download(&record.file_id).await.unwrap(), data);
}

#[tokio::test]
async fn test_priced_upload_without_peers_fails() {
    let cluster = Cluster::new(&["worker-a"]);

    let result = cluster.upload(&pattern(1000), 2).await;

    assert!(matches!(result, Err(Error::NoEligiblePeer(_))));
    assert!(files_in(cluster.store.stage_dir()).is_empty());
}

#[tokio::test]
async fn test_declined_chunk_goes_to_next_peer() {
    let cluster = Cluster::new(&["worker-r", "worker-a"]);
    let refusing = Arc::new(Refusing {
        id: "worker-r".into(),
        asked: AtomicUsize::new(0),
    });
    cluster.directory.insert(refusing.clone());
    cluster.add_worker("worker-a");
    let data = pattern(50_000);

    let record = cluster.upload(&data, 1).await.unwrap();

    assert_eq!(refusing.asked.load(Ordering::SeqCst), 2);
    let layout = cluster.catalog.chunk_metadata(&record.file_id).unwrap();
    assert!(layout
        .iter()
        .all(|chunk| chunk.custodian.as_deref() == Some("worker-a")));

    // The custodian is asked first, so the refusing peer is never consulted
    assert_eq!(cluster.download(&record.file_id).await.unwrap(), data);
    assert_eq!(refusing.asked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_untrusted_peer_never_asked() {
    let cluster = Cluster::new(&["worker-a"]);
    let stranger = Arc::new(Refusing {
        id: "stranger".into(),
        asked: AtomicUsize::new(0),
    });
    cluster.directory.insert(stranger.clone());
    cluster.add_worker("worker-a");

    cluster.upload(&pattern(5000), 1).await.unwrap();

    assert_eq!(stranger.asked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_removes_file() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let data = pattern(20_000);
    let record = cluster.upload(&data, 1).await.unwrap();
    cluster.download(&record.file_id).await.unwrap();

    cluster.store.delete_file(&record.file_id).await.unwrap();

    assert_eq!(cluster.catalog.file(&record.file_id).unwrap(), None);
    assert!(cluster.catalog.chunk_metadata(&record.file_id).unwrap().is_empty());
    assert!(files_in(cluster.store.stage_dir()).is_empty());
    assert!(files_in(&cluster.cache()).is_empty());
    assert!(!cluster.objects().join(&record.content_address).exists());
    assert!(matches!(
        cluster.download(&record.file_id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_existing_file_id_rejected() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let first = vec![1u8; 10_000];

    upload_to(&cluster.store, Some("fixed"), &first, 1).await.unwrap();
    let second = upload_to(&cluster.store, Some("fixed"), &[2u8; 10_000], 1).await;

    assert!(matches!(second, Err(Error::InvalidInput(_))), "{:?}", second);
    assert_eq!(cluster.download("fixed").await.unwrap(), first);
    assert!(files_in(cluster.store.stage_dir()).is_empty());
}

#[tokio::test]
async fn test_catalog_failure_discards_object() {
    let cluster = Cluster::new(&["worker-a"]);
    cluster.add_worker("worker-a");
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(cluster.objects()).unwrap());
    let store = StoreService::new(
        store_settings(cluster.root.path(), &["worker-a"]),
        objects,
        Arc::new(ReadOnlyCatalog),
        cluster.transport.clone(),
        cluster.directory.clone(),
    )
    .unwrap();

    let priced = upload_to(&store, None, &pattern(30_000), 4).await;
    assert!(matches!(priced, Err(Error::Database(_))), "{:?}", priced);
    assert!(files_in(&cluster.objects()).is_empty());

    let free = upload_to(&store, None, b"free sample", 0).await;
    assert!(matches!(free, Err(Error::Database(_))), "{:?}", free);
    assert!(files_in(&cluster.objects()).is_empty());
    assert!(files_in(store.stage_dir()).is_empty());
}

#[tokio::test]
async fn test_stopped_network_aborts_download() {
    let cluster = Cluster::new(&["worker-a", "worker-r"]);
    cluster.add_worker("worker-a");
    let record = cluster.upload(&pattern(100_000), 2).await.unwrap();

    cluster.directory.insert(Arc::new(Stopped {
        id: "worker-a".into(),
    }));
    let fallback = Arc::new(Refusing {
        id: "worker-r".into(),
        asked: AtomicUsize::new(0),
    });
    cluster.directory.insert(fallback.clone());

    let result = cluster.download(&record.file_id).await;
    assert!(matches!(result, Err(Error::Transport(_))), "{:?}", result.err());
    assert_eq!(fallback.asked.load(Ordering::SeqCst), 0);
    assert!(files_in(&cluster.cache()).is_empty());
}
