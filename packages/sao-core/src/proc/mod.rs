//! # Processing Worker
//!
//! Seals and opens chunks on behalf of orchestrators.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WORKER STREAM LIFECYCLE                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  AwaitRequest ──► Processing ──► RespondAccepted ──► Closed            │
//! │       │                │                                                │
//! │       │ malformed      │ any failure                                    │
//! │       └────────────────┴──────► RespondRejected ──► Closed             │
//! │                                                                         │
//! │  Encrypt:  pull <stage>/<fileId>_<offset>                              │
//! │            seal → <fileId>_<offset>.encrypt, store key record         │
//! │            answer with a descriptor for the .encrypt file             │
//! │                                                                         │
//! │  Decrypt:  look up key (miss → reject before any transfer)            │
//! │            pull <fileId>_<offset>.encrypt unless already staged       │
//! │            open → <fileId>_<offset>.decrypt                           │
//! │            answer with a descriptor for the .decrypt file             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests for the same `(fileId, offset)` are serialised, and staged
//! artifacts from an earlier request are reused, so repeating a request is
//! cheap and yields an equivalent answer.

pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::config::{Config, RepoLayout};
use crate::context::Context;
use crate::crypto::{self, sealed_size, SEAL_OVERHEAD};
use crate::error::{Error, Result};
use crate::network::{
    FileDecryptRequest, FileDecryptResponse, FileEncryptRequest, FileEncryptResponse, Frame,
    InboundRequest, PeerChannel,
};
use crate::storage::chunking::{check_file_id, remove_quietly, with_suffix};
use crate::storage::{KeyCustody, KeyRecord};
use crate::transfer::{http_descriptor, transfer_file, Transport};

/// Suffix of a sealed chunk in the staging directory
pub const ENCRYPTED_SUFFIX: &str = ".encrypt";

/// Suffix of an opened chunk in the staging directory
pub const DECRYPTED_SUFFIX: &str = ".decrypt";

/// Settings of a worker
#[derive(Debug, Clone)]
pub struct ProcSettings {
    /// Directory holding staged chunks
    pub stage_dir: PathBuf,
    /// Public base URL of this node's file server
    pub advertised_base: String,
    /// Upper bound on one chunk transfer
    pub max_transfer_duration: Duration,
    /// Upper bound on handling one inbound request
    pub request_deadline: Duration,
}

impl ProcSettings {
    /// Worker settings from the node configuration
    pub fn from_config(config: &Config, layout: &RepoLayout) -> Self {
        Self {
            stage_dir: layout.proc_stage(),
            advertised_base: config.advertised_base(),
            max_transfer_duration: config.transport.max_transfer_duration(),
            request_deadline: config.proc.write_deadline(),
        }
    }
}

/// A processing worker
pub struct ProcNode {
    settings: ProcSettings,
    keys: Arc<dyn KeyCustody>,
    transport: Arc<dyn Transport>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProcNode {
    /// Create a worker, creating its staging directory
    ///
    /// The worker's identity is the key store's custodian.
    pub fn new(
        settings: ProcSettings,
        keys: Arc<dyn KeyCustody>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.stage_dir)?;
        Ok(Self {
            settings,
            keys,
            transport,
            locks: DashMap::new(),
        })
    }

    /// Peer id of this worker
    pub fn peer_id(&self) -> &str {
        self.keys.custodian()
    }

    /// Staging directory
    pub fn stage_dir(&self) -> &Path {
        &self.settings.stage_dir
    }

    /// Answer an encrypt request. Failures become a refusal.
    pub async fn handle_encrypt(
        &self,
        ctx: &Context,
        request: FileEncryptRequest,
    ) -> FileEncryptResponse {
        let file_id = request.file_id.clone();
        let offset = request.offset;
        match self.encrypt(ctx, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(file_id = %file_id, offset, error = %e, "Encrypt request rejected");
                FileEncryptResponse::rejected()
            }
        }
    }

    /// Answer a decrypt request. Failures become a refusal.
    pub async fn handle_decrypt(
        &self,
        ctx: &Context,
        request: FileDecryptRequest,
    ) -> FileDecryptResponse {
        let file_id = request.file_id.clone();
        let offset = request.offset;
        match self.decrypt(ctx, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(file_id = %file_id, offset, error = %e, "Decrypt request rejected");
                FileDecryptResponse::rejected()
            }
        }
    }

    /// Answer inbound requests until the stream ends, one task per request
    pub async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundRequest>) {
        tracing::info!(peer_id = %self.peer_id(), "Processing worker serving");
        while let Some(request) = inbound.recv().await {
            let node = self.clone();
            tokio::spawn(async move { node.answer(request).await });
        }
        tracing::info!("Inbound request stream closed, worker stopping");
    }

    async fn answer(&self, request: InboundRequest) {
        let ctx = Context::background().with_timeout(self.settings.request_deadline);
        let sent = match request {
            InboundRequest::Encrypt {
                peer,
                request,
                responder,
            } => {
                let response = match request {
                    Frame::Valid(request) => self.handle_encrypt(&ctx, request).await,
                    Frame::Malformed(reason) => {
                        tracing::warn!(peer = %peer, reason = %reason, "Malformed encrypt request");
                        FileEncryptResponse::rejected()
                    }
                };
                responder.respond(response).await
            }
            InboundRequest::Decrypt {
                peer,
                request,
                responder,
            } => {
                let response = match request {
                    Frame::Valid(request) => self.handle_decrypt(&ctx, request).await,
                    Frame::Malformed(reason) => {
                        tracing::warn!(peer = %peer, reason = %reason, "Malformed decrypt request");
                        FileDecryptResponse::rejected()
                    }
                };
                responder.respond(response).await
            }
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "Could not send response");
        }
    }

    // ========================================================================
    // ENCRYPT
    // ========================================================================

    async fn encrypt(&self, ctx: &Context, request: FileEncryptRequest) -> Result<FileEncryptResponse> {
        check_file_id(&request.file_id)?;
        if request.size == 0 {
            return Err(Error::InvalidInput("chunk size must be non-zero".into()));
        }
        if request.transfer.size != request.size {
            return Err(Error::InvalidInput(format!(
                "transfer describes {} bytes for a {} byte chunk",
                request.transfer.size, request.size
            )));
        }

        let key = lock_key(&request.file_id, request.offset);
        let guard = self.lock(&key).await;
        let result = self.seal_staged(ctx, &request).await;
        drop(guard);
        self.release(&key);

        let (record, sealed) = result?;
        let url = self.url_for("encrypt", &sealed)?;
        tracing::info!(
            file_id = %request.file_id,
            offset = request.offset,
            size = record.size,
            "Chunk sealed"
        );
        Ok(FileEncryptResponse {
            file_key: record.id,
            transfer: http_descriptor(url, record.size)?,
            accepted: true,
        })
    }

    async fn seal_staged(
        &self,
        ctx: &Context,
        request: &FileEncryptRequest,
    ) -> Result<(KeyRecord, PathBuf)> {
        let base = self.stage_path(&request.file_id, request.offset);
        let sealed = with_suffix(&base, ENCRYPTED_SUFFIX);
        let expected = sealed_size(request.size);

        match self.keys.get(&request.file_id, expected, request.offset) {
            Ok(record) if file_len(&sealed).await == Some(expected) => {
                tracing::debug!(
                    file_id = %request.file_id,
                    offset = request.offset,
                    "Reusing sealed chunk"
                );
                return Ok((record, sealed));
            }
            Ok(_) | Err(Error::KeyNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let transfer_ctx = ctx.with_timeout(self.settings.max_transfer_duration);
        transfer_file(
            &transfer_ctx,
            self.transport.as_ref(),
            &request.transfer,
            &request.file_id,
            &base,
        )
        .await?;

        let sealed_file = {
            let input = base.clone();
            let output = sealed.clone();
            let outcome = tokio::task::spawn_blocking(move || crypto::encrypt_file(&input, &output))
                .await
                .map_err(|e| Error::Internal(format!("seal task failed: {}", e)));
            remove_quietly(&base).await;
            outcome??
        };

        let record = KeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: request.file_id.clone(),
            offset: request.offset,
            size: sealed_file.size,
            key: sealed_file.key,
            nonce: sealed_file.nonce,
            custodian: self.keys.custodian().to_string(),
        };
        if let Err(e) = self.keys.put(&record) {
            remove_quietly(&sealed).await;
            return Err(e);
        }
        Ok((record, sealed))
    }

    // ========================================================================
    // DECRYPT
    // ========================================================================

    async fn decrypt(&self, ctx: &Context, request: FileDecryptRequest) -> Result<FileDecryptResponse> {
        check_file_id(&request.file_id)?;
        if request.size <= SEAL_OVERHEAD {
            return Err(Error::InvalidInput(format!(
                "sealed chunk of {} bytes is too small",
                request.size
            )));
        }
        if request.transfer.size != request.size {
            return Err(Error::InvalidInput(format!(
                "transfer describes {} bytes for a {} byte sealed chunk",
                request.transfer.size, request.size
            )));
        }

        // Without our key there is nothing to do, so do not pull anything.
        let record = self.keys.get(&request.file_id, request.size, request.offset)?;

        let key = lock_key(&request.file_id, request.offset);
        let guard = self.lock(&key).await;
        let result = self.open_staged(ctx, &request, &record).await;
        drop(guard);
        self.release(&key);

        let opened = result?;
        let size = request.size - SEAL_OVERHEAD;
        let url = self.url_for("decrypt", &opened)?;
        tracing::info!(
            file_id = %request.file_id,
            offset = request.offset,
            size,
            "Chunk opened"
        );
        Ok(FileDecryptResponse {
            file_id: request.file_id,
            offset: request.offset,
            size,
            transfer: http_descriptor(url, size)?,
            accepted: true,
        })
    }

    async fn open_staged(
        &self,
        ctx: &Context,
        request: &FileDecryptRequest,
        record: &KeyRecord,
    ) -> Result<PathBuf> {
        let base = self.stage_path(&request.file_id, request.offset);
        let sealed = with_suffix(&base, ENCRYPTED_SUFFIX);
        let opened = with_suffix(&base, DECRYPTED_SUFFIX);
        let plain_size = request.size - SEAL_OVERHEAD;

        if file_len(&opened).await == Some(plain_size) {
            tracing::debug!(file_id = %request.file_id, offset = request.offset, "Reusing opened chunk");
            return Ok(opened);
        }

        let staged = file_len(&sealed).await == Some(request.size);
        if staged {
            match self.open_file(&sealed, &opened, record).await {
                Ok(()) => return Ok(opened),
                Err(e) => {
                    // A stale sealed chunk from an older key; fetch the caller's copy.
                    tracing::debug!(error = %e, "Staged sealed chunk did not open");
                    remove_quietly(&sealed).await;
                }
            }
        }

        let transfer_ctx = ctx.with_timeout(self.settings.max_transfer_duration);
        transfer_file(
            &transfer_ctx,
            self.transport.as_ref(),
            &request.transfer,
            &request.file_id,
            &sealed,
        )
        .await?;
        self.open_file(&sealed, &opened, record).await?;
        Ok(opened)
    }

    async fn open_file(&self, sealed: &Path, opened: &Path, record: &KeyRecord) -> Result<()> {
        let input = sealed.to_path_buf();
        let output = opened.to_path_buf();
        let key = record.key.clone();
        tokio::task::spawn_blocking(move || crypto::decrypt_file(&input, &output, key.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("open task failed: {}", e)))??;
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn stage_path(&self, file_id: &str, offset: u64) -> PathBuf {
        self.settings.stage_dir.join(lock_key(file_id, offset))
    }

    fn url_for(&self, kind: &str, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Internal(format!("unnamed staging path {}", path.display())))?;
        Ok(format!(
            "{}/api/v1/proc/{}/{}",
            self.settings.advertised_base, kind, name
        ))
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn release(&self, key: &str) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[async_trait]
impl PeerChannel for ProcNode {
    fn peer_id(&self) -> String {
        self.keys.custodian().to_string()
    }

    async fn encrypt(
        &self,
        ctx: &Context,
        request: FileEncryptRequest,
    ) -> Result<FileEncryptResponse> {
        Ok(self.handle_encrypt(ctx, request).await)
    }

    async fn decrypt(
        &self,
        ctx: &Context,
        request: FileDecryptRequest,
    ) -> Result<FileDecryptResponse> {
        Ok(self.handle_decrypt(ctx, request).await)
    }
}

impl std::fmt::Debug for ProcNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcNode")
            .field("peer_id", &self.peer_id())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn lock_key(file_id: &str, offset: u64) -> String {
    format!("{}_{}", file_id, offset)
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}
