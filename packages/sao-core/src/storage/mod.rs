//! # Storage Module
//!
//! Local persistence for both node roles.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            STORAGE LAYER                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  chunking   split / combine files on disk (both roles)                 │
//! │  key_store  chunk keys sealed by this node (worker role)               │
//! │  catalog    file records + ciphertext layouts (orchestrator role)      │
//! │  database   shared SQLite wrapper and schema                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod chunking;
mod database;
pub mod key_store;
mod schema;

pub use catalog::{validate_layout, ChunkMetadata, FileCatalog, FileRecord, SqliteCatalog};
pub use chunking::{combine_files, part_sizes, split_by_layout, split_file, SplitDescriptor};
pub use database::Database;
pub use key_store::{KeyCustody, KeyRecord, MemoryKeyStore, SqliteKeyStore};
