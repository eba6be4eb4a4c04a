//! # Store Orchestrator
//!
//! Uploads, downloads and deletes files, farming chunk sealing and opening
//! out to trusted workers.
//!
//! ## Upload (price > 0)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            UPLOAD                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  reader ──split──► <stage>/<id>_<name>_0 .. _N                         │
//! │                         │                                               │
//! │                         ▼  per chunk: ask candidates in turn           │
//! │           FileEncryptRequest{offset = cipher offset}                    │
//! │                         │  accepted                                     │
//! │                         ▼                                               │
//! │           pull sealed chunk ──► <stage>/<id>_<name>_i.encrypt          │
//! │                         │                                               │
//! │                         ▼                                               │
//! │  validate layout ──combine──► <stage>/<id>_<name>.encrypt             │
//! │                         │                                               │
//! │                         ▼                                               │
//! │  object store ──► content address ──► catalog (record + layout)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Download
//!
//! The blob is re-cut along the stored layout, each sealed chunk is opened
//! by its custodian (falling back to other trusted peers), and the opened
//! chunks are combined into `<cache>/<id>_<name>.original`, which later
//! downloads reuse. The cache directory is never served to peers.
//!
//! Price 0 files skip all of this and go to the object store as is. Every
//! intermediate file is removed whether the operation succeeds or not.

pub mod ipfs;
pub mod object_store;
pub mod selection;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::Mutex;

pub use ipfs::IpfsStore;
pub use object_store::{LocalObjectStore, ObjectReader, ObjectStore, StoreInfo, StoreReceipt};
pub use selection::RetryPolicy;

use crate::config::{Config, RepoLayout};
use crate::context::Context;
use crate::crypto::{partial_path, sealed_size, SEAL_OVERHEAD};
use crate::error::{Error, Result};
use crate::network::{FileDecryptRequest, FileEncryptRequest, PeerDirectory};
use crate::storage::chunking::{
    check_file_id, part_path, remove_quietly, with_suffix, SplitDescriptor,
};
use crate::storage::{
    combine_files, split_by_layout, split_file, validate_layout, ChunkMetadata, FileCatalog,
    FileRecord,
};
use crate::transfer::{http_descriptor, transfer_file, TransferDescriptor, Transport};

const SEALED_SUFFIX: &str = ".encrypt";
const OPENED_SUFFIX: &str = ".decrypt";
const CACHE_SUFFIX: &str = ".original";

/// Settings of an orchestrator
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Parts a priced file is split into
    pub part_count: usize,
    /// Largest window copied between syncs
    pub chunk_threshold: u64,
    /// Which peers are asked, and how many
    pub retry: RetryPolicy,
    /// Chunks processed at once
    pub chunk_concurrency: usize,
    /// Public base URL of this node's file server
    pub advertised_base: String,
    /// Directory holding chunks handed to workers
    pub stage_dir: PathBuf,
    /// Directory holding assembled plaintext of downloaded files
    pub cache_dir: PathBuf,
    /// Peer ids allowed to process chunks, in preference order
    pub trusted_peers: Vec<String>,
    /// Upper bound on one chunk transfer
    pub max_transfer_duration: Duration,
}

impl StoreSettings {
    /// Orchestrator settings from the node configuration
    pub fn from_config(config: &Config, layout: &RepoLayout) -> Self {
        Self {
            part_count: config.store.part_count,
            chunk_threshold: config.store.chunk_threshold,
            retry: RetryPolicy::from_config(&config.store),
            chunk_concurrency: config.store.chunk_concurrency.max(1),
            advertised_base: config.advertised_base(),
            stage_dir: layout.store_stage(),
            cache_dir: layout.download_cache(),
            trusted_peers: config.trusted_peer_ids(),
            max_transfer_duration: config.transport.max_transfer_duration(),
        }
    }
}

/// Metadata supplied with an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    /// Id to store under; a fresh uuid when absent
    pub file_id: Option<String>,
    /// Original file name
    pub filename: String,
    /// MIME type
    pub content_type: String,
    /// Bytes the reader will yield
    pub size: u64,
    /// Price in the smallest currency unit; non-zero means encrypted
    pub price: u64,
    /// Uploading client
    pub client_id: String,
}

/// A chunk sealed by a worker and pulled back
#[derive(Debug)]
struct SealedChunk {
    part: SplitDescriptor,
    cipher_offset: u64,
    custodian: String,
    path: PathBuf,
}

/// Temporary files removed when an operation ends
#[derive(Debug, Default)]
struct Scratch(Vec<PathBuf>);

impl Scratch {
    fn track(&mut self, path: PathBuf) {
        self.0.push(path);
    }

    async fn clean(self) {
        for path in &self.0 {
            remove_quietly(path).await;
        }
    }
}

/// The store orchestrator
pub struct StoreService {
    settings: StoreSettings,
    object_store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn FileCatalog>,
    transport: Arc<dyn Transport>,
    peers: Arc<dyn PeerDirectory>,
    downloads: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreService {
    /// Create an orchestrator, creating its staging directory
    pub fn new(
        settings: StoreSettings,
        object_store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn FileCatalog>,
        transport: Arc<dyn Transport>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Result<Self> {
        if settings.part_count == 0 {
            return Err(Error::Config("part count must be at least 1".into()));
        }
        std::fs::create_dir_all(&settings.stage_dir)?;
        std::fs::create_dir_all(&settings.cache_dir)?;
        Ok(Self {
            settings,
            object_store,
            catalog,
            transport,
            peers,
            downloads: DashMap::new(),
        })
    }

    /// Staging directory served under `/api/v1/proc/file`
    pub fn stage_dir(&self) -> &Path {
        &self.settings.stage_dir
    }

    // ========================================================================
    // UPLOAD
    // ========================================================================

    /// Store everything `reader` yields and record it in the catalog
    pub async fn store_file(
        &self,
        ctx: &Context,
        reader: ObjectReader,
        request: StoreRequest,
    ) -> Result<FileRecord> {
        if request.size == 0 {
            return Err(Error::InvalidInput("cannot store an empty file".into()));
        }
        let file_id = request
            .file_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        check_file_id(&file_id)?;
        if self.catalog.file(&file_id)?.is_some() {
            return Err(Error::InvalidInput(format!("file {} already exists", file_id)));
        }
        ctx.check()?;

        let mut record = FileRecord {
            file_id: file_id.clone(),
            filename: request.filename.clone(),
            content_type: request.content_type.clone(),
            size: request.size,
            price: request.price,
            content_address: String::new(),
            encrypted: request.price > 0,
            client_id: request.client_id.clone(),
            created_at: chrono::Utc::now().timestamp(),
        };

        if !record.encrypted {
            let info = StoreInfo {
                file_id: file_id.clone(),
                filename: request.filename.clone(),
                size: request.size,
            };
            let receipt = self.object_store.store_file(reader, &info).await?;
            record.content_address = receipt.content_address;
            if let Err(e) = self.catalog.put_file(&record) {
                self.discard_object(&record.content_address).await;
                return Err(e);
            }
            tracing::info!(file_id = %file_id, size = record.size, "Stored unencrypted file");
            return Ok(record);
        }

        let base = self.stage_base(&file_id, &request.filename);
        let mut scratch = Scratch::default();
        let result = self
            .encrypt_and_store(ctx, reader, &mut record, &base, &mut scratch)
            .await;
        scratch.clean().await;

        match result {
            Ok(()) => {
                tracing::info!(file_id = %file_id, size = record.size, "Stored encrypted file");
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Upload failed");
                Err(e)
            }
        }
    }

    async fn encrypt_and_store(
        &self,
        ctx: &Context,
        mut reader: ObjectReader,
        record: &mut FileRecord,
        base: &Path,
        scratch: &mut Scratch,
    ) -> Result<()> {
        let known = self.peers.known_peers();
        let candidates = self
            .settings
            .retry
            .candidates(&known, &self.settings.trusted_peers);
        if candidates.is_empty() {
            return Err(Error::NoEligiblePeer(format!(
                "no trusted peer reachable for {}",
                record.file_id
            )));
        }

        let parts = split_file(
            ctx,
            &mut reader,
            record.size,
            base,
            self.settings.part_count,
            self.settings.chunk_threshold,
        )
        .await?;
        drop(reader);
        for part in &parts {
            scratch.track(part.path.clone());
            scratch.track(with_suffix(&part.path, SEALED_SUFFIX));
        }

        let sealed: Vec<SealedChunk> = futures::stream::iter(parts.into_iter().map(|part| {
            self.encrypt_chunk(ctx, &record.file_id, &record.client_id, part, &candidates)
        }))
        .buffered(self.settings.chunk_concurrency)
        .try_collect()
        .await?;

        let layout: Vec<ChunkMetadata> = sealed
            .iter()
            .map(|chunk| ChunkMetadata {
                file_id: record.file_id.clone(),
                index: chunk.part.index,
                plaintext_offset: chunk.part.plaintext_offset,
                plaintext_size: chunk.part.size,
                cipher_offset: chunk.cipher_offset,
                cipher_size: sealed_size(chunk.part.size),
                custodian: Some(chunk.custodian.clone()),
            })
            .collect();
        let cipher_total = validate_layout(&layout)?;

        let blob = with_suffix(base, SEALED_SUFFIX);
        scratch.track(blob.clone());
        let paths: Vec<PathBuf> = sealed.iter().map(|chunk| chunk.path.clone()).collect();
        let written = combine_files(ctx, &paths, &blob, self.settings.chunk_threshold).await?;
        if written != cipher_total {
            return Err(Error::Internal(format!(
                "combined {} bytes, layout covers {}",
                written, cipher_total
            )));
        }

        ctx.check()?;
        let info = StoreInfo {
            file_id: record.file_id.clone(),
            filename: record.filename.clone(),
            size: cipher_total,
        };
        let file = tokio::fs::File::open(&blob).await?;
        let receipt = self.object_store.store_file(Box::new(file), &info).await?;
        record.content_address = receipt.content_address;

        if let Err(e) = self.catalog.put_file_with_layout(record, &layout) {
            self.discard_object(&record.content_address).await;
            return Err(e);
        }
        Ok(())
    }

    async fn encrypt_chunk(
        &self,
        ctx: &Context,
        file_id: &str,
        client_id: &str,
        part: SplitDescriptor,
        candidates: &[String],
    ) -> Result<SealedChunk> {
        // Every chunk before this one grew by the seal overhead.
        let cipher_offset = part.plaintext_offset + part.index as u64 * SEAL_OVERHEAD;
        let request = FileEncryptRequest {
            file_id: file_id.to_string(),
            client_id: client_id.to_string(),
            offset: cipher_offset,
            size: part.size,
            transfer: self.descriptor_for(&part.path, part.size)?,
        };
        let expected = sealed_size(part.size);

        let mut failures = Vec::new();
        for peer in candidates {
            ctx.check()?;
            let Some(channel) = self.peers.channel(peer) else {
                failures.push(format!("{}: unreachable", peer));
                continue;
            };

            let response = match channel.encrypt(ctx, request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    ctx.check()?;
                    tracing::warn!(peer = %peer, file_id, index = part.index, error = %e, "Encrypt request failed");
                    failures.push(format!("{}: {}", peer, e));
                    continue;
                }
            };
            if !response.accepted {
                tracing::info!(peer = %peer, file_id, index = part.index, "Encrypt request declined");
                failures.push(format!("{}: declined", peer));
                continue;
            }
            if response.transfer.size != expected {
                return Err(Error::Protocol(format!(
                    "{} returned a {} byte sealed chunk, expected {}",
                    peer, response.transfer.size, expected
                )));
            }

            let out = with_suffix(&part.path, SEALED_SUFFIX);
            let transfer_ctx = ctx.with_timeout(self.settings.max_transfer_duration);
            transfer_file(
                &transfer_ctx,
                self.transport.as_ref(),
                &response.transfer,
                file_id,
                &out,
            )
            .await?;
            remove_quietly(&part.path).await;

            tracing::debug!(peer = %peer, file_id, index = part.index, cipher_offset, "Chunk sealed");
            return Ok(SealedChunk {
                part,
                cipher_offset,
                custodian: peer.clone(),
                path: out,
            });
        }

        Err(Error::NoEligiblePeer(format!(
            "chunk {} of {}: {}",
            part.index,
            file_id,
            failures.join("; ")
        )))
    }

    // ========================================================================
    // DOWNLOAD
    // ========================================================================

    /// Look up `file_id` and stream its plaintext
    pub async fn get_file(&self, ctx: &Context, file_id: &str) -> Result<(FileRecord, ObjectReader)> {
        check_file_id(file_id)?;
        let record = self
            .catalog
            .file(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;

        if !record.encrypted {
            let reader = self.object_store.get_file(&record.content_address).await?;
            return Ok((record, reader));
        }

        let lock = self.downloads.entry(file_id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        let result = self.cached_plaintext(ctx, &record).await;
        drop(guard);
        self.downloads
            .remove_if(file_id, |_, lock| Arc::strong_count(lock) == 1);

        let cache = result?;
        let file = tokio::fs::File::open(&cache).await?;
        Ok((record, Box::new(file)))
    }

    async fn cached_plaintext(&self, ctx: &Context, record: &FileRecord) -> Result<PathBuf> {
        let cache = self.cache_path(&record.file_id, &record.filename);
        if file_len(&cache).await == Some(record.size) {
            tracing::debug!(file_id = %record.file_id, "Serving cached plaintext");
            return Ok(cache);
        }

        let layout = self.catalog.chunk_metadata(&record.file_id)?;
        validate_layout(&layout)?;
        let plain_total: u64 = layout.iter().map(|c| c.plaintext_size).sum();
        if plain_total != record.size {
            return Err(Error::Decode(format!(
                "layout of {} covers {} bytes, record says {}",
                record.file_id, plain_total, record.size
            )));
        }

        let base = self.stage_base(&record.file_id, &record.filename);
        let mut scratch = Scratch::default();
        let result = self
            .decrypt_into(ctx, record, &layout, &base, &cache, &mut scratch)
            .await;
        scratch.clean().await;

        match result {
            Ok(()) => {
                tracing::info!(file_id = %record.file_id, size = record.size, "Download assembled");
                Ok(cache)
            }
            Err(e) => {
                tracing::warn!(file_id = %record.file_id, error = %e, "Download failed");
                Err(e)
            }
        }
    }

    async fn decrypt_into(
        &self,
        ctx: &Context,
        record: &FileRecord,
        layout: &[ChunkMetadata],
        base: &Path,
        cache: &Path,
        scratch: &mut Scratch,
    ) -> Result<()> {
        let opened: Vec<PathBuf> = layout
            .iter()
            .map(|chunk| with_suffix(&part_path(base, chunk.index), OPENED_SUFFIX))
            .collect();
        for chunk in layout {
            scratch.track(with_suffix(&part_path(base, chunk.index), SEALED_SUFFIX));
        }
        for path in &opened {
            scratch.track(path.clone());
        }
        let assembling = partial_path(cache);
        scratch.track(assembling.clone());

        let mut blob = self.object_store.get_file(&record.content_address).await?;
        let sizes: Vec<u64> = layout.iter().map(|chunk| chunk.cipher_size).collect();
        let sealed = split_by_layout(
            ctx,
            &mut blob,
            &sizes,
            base,
            SEALED_SUFFIX,
            self.settings.chunk_threshold,
        )
        .await?;
        drop(blob);

        let known = self.peers.known_peers();
        futures::stream::iter(layout.iter().zip(sealed.iter()).zip(opened.iter()).map(
            |((chunk, sealed), opened)| self.decrypt_chunk(ctx, record, chunk, sealed, opened, &known),
        ))
        .buffered(self.settings.chunk_concurrency)
        .try_collect::<Vec<()>>()
        .await?;

        let written = combine_files(ctx, &opened, &assembling, self.settings.chunk_threshold).await?;
        if written != record.size {
            return Err(Error::Decode(format!(
                "assembled {} bytes for {}, expected {}",
                written, record.file_id, record.size
            )));
        }
        tokio::fs::rename(&assembling, cache).await?;
        Ok(())
    }

    async fn decrypt_chunk(
        &self,
        ctx: &Context,
        record: &FileRecord,
        chunk: &ChunkMetadata,
        sealed: &Path,
        opened: &Path,
        known: &[String],
    ) -> Result<()> {
        let request = FileDecryptRequest {
            file_id: record.file_id.clone(),
            client_id: record.client_id.clone(),
            offset: chunk.cipher_offset,
            size: chunk.cipher_size,
            transfer: self.descriptor_for(sealed, chunk.cipher_size)?,
        };
        let candidates = self.settings.retry.decrypt_candidates(
            chunk.custodian.as_deref(),
            known,
            &self.settings.trusted_peers,
        );

        let mut failures = Vec::new();
        for peer in &candidates {
            ctx.check()?;
            let Some(channel) = self.peers.channel(peer) else {
                failures.push(format!("{}: unreachable", peer));
                continue;
            };

            let response = match channel.decrypt(ctx, request.clone()).await {
                Ok(response) if response.accepted => response,
                Ok(_) => {
                    tracing::info!(peer = %peer, file_id = %record.file_id, index = chunk.index, "Decrypt request declined");
                    failures.push(format!("{}: declined", peer));
                    continue;
                }
                Err(e) => {
                    ctx.check()?;
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    tracing::warn!(peer = %peer, file_id = %record.file_id, index = chunk.index, error = %e, "Decrypt request failed");
                    failures.push(format!("{}: {}", peer, e));
                    continue;
                }
            };
            if response.size != chunk.plaintext_size || response.transfer.size != chunk.plaintext_size {
                failures.push(format!(
                    "{}: answered {} bytes, expected {}",
                    peer, response.size, chunk.plaintext_size
                ));
                continue;
            }

            let transfer_ctx = ctx.with_timeout(self.settings.max_transfer_duration);
            match transfer_file(
                &transfer_ctx,
                self.transport.as_ref(),
                &response.transfer,
                &record.file_id,
                opened,
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    ctx.check()?;
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    failures.push(format!("{}: {}", peer, e));
                }
            }
        }

        Err(Error::NoEligiblePeer(format!(
            "chunk {} of {}: {}",
            chunk.index,
            record.file_id,
            if failures.is_empty() {
                "no candidate peers".to_string()
            } else {
                failures.join("; ")
            }
        )))
    }

    // ========================================================================
    // DELETE
    // ========================================================================

    /// Remove `file_id` from the backing store, the catalog and the cache
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        check_file_id(file_id)?;
        let record = self
            .catalog
            .file(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;

        match self.object_store.delete_file(&record.content_address).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.catalog.delete_file(file_id)?;
        remove_quietly(&self.cache_path(file_id, &record.filename)).await;

        tracing::info!(file_id, "File deleted");
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn stage_base(&self, file_id: &str, filename: &str) -> PathBuf {
        self.settings
            .stage_dir
            .join(format!("{}_{}", file_id, basename(filename)))
    }

    fn cache_path(&self, file_id: &str, filename: &str) -> PathBuf {
        self.settings
            .cache_dir
            .join(format!("{}_{}{}", file_id, basename(filename), CACHE_SUFFIX))
    }

    /// Remove an object no catalog record points at
    async fn discard_object(&self, content_address: &str) {
        if let Err(e) = self.object_store.delete_file(content_address).await {
            tracing::warn!(content_address, error = %e, "Failed to remove unrecorded object");
        }
    }

    fn descriptor_for(&self, path: &Path, size: u64) -> Result<TransferDescriptor> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Internal(format!("unnamed staging path {}", path.display())))?;
        http_descriptor(
            format!("{}/api/v1/proc/file/{}", self.settings.advertised_base, name),
            size,
        )
    }
}

impl std::fmt::Debug for StoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Last path component of an uploaded file name, safe to use in a path
fn basename(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename() {
        assert_eq!(basename("report.pdf"), "report.pdf");
        assert_eq!(basename("/home/u/report.pdf"), "report.pdf");
        assert_eq!(basename("C:\\docs\\a.txt"), "a.txt");
        assert_eq!(basename("dir/"), "file");
        assert_eq!(basename(".."), "file");
    }
}
