//! # Database Schema
//!
//! SQL schema definitions for the key custody and catalog databases.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐      ┌──────────────────┐   │
//! │  │   key_store     │    │     files       │      │ chunk_metadata   │   │
//! │  ├─────────────────┤    ├─────────────────┤      ├──────────────────┤   │
//! │  │ id              │    │ file_id         │◄─────│ file_id          │   │
//! │  │ file_id         │    │ filename        │      │ chunk_index      │   │
//! │  │ chunk_offset    │    │ content_type    │      │ plaintext_offset │   │
//! │  │ chunk_size      │    │ size            │      │ plaintext_size   │   │
//! │  │ key_bytes       │    │ price           │      │ cipher_offset    │   │
//! │  │ nonce_bytes     │    │ content_address │      │ cipher_size      │   │
//! │  │ custodian       │    │ encrypted       │      │ custodian        │   │
//! │  │ created_at      │    │ client_id       │      └──────────────────┘   │
//! │  └─────────────────┘    │ created_at      │                             │
//! │                         └─────────────────┘                             │
//! │                                                                         │
//! │  key_store lives on the worker that sealed the chunk. files and        │
//! │  chunk_metadata live on the orchestrator.                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Key custody
-- One row per chunk this node sealed. Never replicated to other nodes.
CREATE TABLE IF NOT EXISTS key_store (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    -- Ciphertext offset of the chunk inside the combined blob
    chunk_offset INTEGER NOT NULL,
    -- Sealed size of the chunk
    chunk_size INTEGER NOT NULL,
    -- AES-256 key (32 bytes)
    key_bytes BLOB NOT NULL,
    -- AES-GCM nonce (12 bytes)
    nonce_bytes BLOB NOT NULL,
    -- Peer id of the node that sealed the chunk
    custodian TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_key_store_lookup ON key_store(file_id, chunk_size, chunk_offset);

-- Files
-- One row per stored object, encrypted or not.
CREATE TABLE IF NOT EXISTS files (
    file_id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    -- Plaintext size
    size INTEGER NOT NULL,
    -- Price in the smallest currency unit; non-zero means encrypted
    price INTEGER NOT NULL DEFAULT 0,
    -- Address returned by the object store
    content_address TEXT NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    client_id TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

-- Chunk metadata
-- Byte layout of the combined ciphertext blob of an encrypted file.
CREATE TABLE IF NOT EXISTS chunk_metadata (
    file_id TEXT NOT NULL REFERENCES files(file_id),
    chunk_index INTEGER NOT NULL,
    plaintext_offset INTEGER NOT NULL,
    plaintext_size INTEGER NOT NULL,
    cipher_offset INTEGER NOT NULL,
    cipher_size INTEGER NOT NULL,
    -- Worker holding the key for this chunk, tried first on download
    custodian TEXT,
    PRIMARY KEY (file_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunk_metadata_order ON chunk_metadata(file_id, cipher_offset);
"#;
