//! # Protocol Messages
//!
//! Envelopes exchanged between an orchestrator and a processing worker.
//!
//! ## Protocols
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       WORKER PROTOCOLS                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  /sao/file/encrypt/0.0.1                                               │
//! │    FileEncryptRequest  { FileId, ClientId, Offset, Size, Transfer }    │
//! │    FileEncryptResponse { FileKey, Transfer, Accepted }                 │
//! │                                                                         │
//! │  /sao/file/decrypt/0.0.1                                               │
//! │    FileDecryptRequest  { FileId, ClientId, Offset, Size, Transfer }    │
//! │    FileDecryptResponse { FileId, Offset, Size, Transfer, Accepted }    │
//! │                                                                         │
//! │  One request and one response per stream. The request Transfer        │
//! │  points at the input bytes, the response Transfer at the result.      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Offset` is the chunk's offset inside the combined ciphertext blob, and
//! together with `FileId` it keys the worker's staging files and key
//! records. For decrypt requests `Size` is the sealed size.

use serde::{Deserialize, Serialize};

use crate::transfer::TransferDescriptor;

/// Protocol id of the encrypt exchange
pub const ENCRYPT_PROTOCOL: &str = "/sao/file/encrypt/0.0.1";

/// Protocol id of the decrypt exchange
pub const DECRYPT_PROTOCOL: &str = "/sao/file/decrypt/0.0.1";

/// Ask a worker to seal one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileEncryptRequest {
    /// File the chunk belongs to
    pub file_id: String,
    /// Owner of the file
    pub client_id: String,
    /// Ciphertext offset the sealed chunk will occupy
    pub offset: u64,
    /// Plaintext size of the chunk
    pub size: u64,
    /// Where the worker pulls the plaintext chunk from
    pub transfer: TransferDescriptor,
}

/// Worker answer to [`FileEncryptRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileEncryptResponse {
    /// Id of the key record the worker stored
    pub file_key: String,
    /// Where the orchestrator pulls the sealed chunk from
    pub transfer: TransferDescriptor,
    /// Whether the chunk was sealed
    pub accepted: bool,
}

impl FileEncryptResponse {
    /// Refusal envelope
    pub fn rejected() -> Self {
        Self::default()
    }
}

/// Ask a worker to open one chunk it sealed earlier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileDecryptRequest {
    /// File the chunk belongs to
    pub file_id: String,
    /// Requesting client
    pub client_id: String,
    /// Ciphertext offset of the chunk
    pub offset: u64,
    /// Sealed size of the chunk
    pub size: u64,
    /// Where the worker pulls the sealed chunk from
    pub transfer: TransferDescriptor,
}

/// Worker answer to [`FileDecryptRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileDecryptResponse {
    /// Echo of the request file id
    pub file_id: String,
    /// Echo of the request offset
    pub offset: u64,
    /// Plaintext size of the opened chunk
    pub size: u64,
    /// Where the orchestrator pulls the plaintext chunk from
    pub transfer: TransferDescriptor,
    /// Whether the chunk was opened
    pub accepted: bool,
}

impl FileDecryptResponse {
    /// Refusal envelope
    pub fn rejected() -> Self {
        Self::default()
    }
}

/// An inbound request as read off the wire
///
/// Requests that fail to decode are still delivered so the worker can
/// answer them with a refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    /// Well-formed request
    Valid(T),
    /// Undecodable request, with the reason
    Malformed(String),
}
