//! # Sao Core
//!
//! Encrypted, chunked file storage for a network of storage nodes. An
//! orchestrator splits each priced file into chunks, has trusted workers
//! seal them, and keeps only the combined ciphertext. Workers keep the keys.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SAO NODE                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   orchestrator role                      worker role                   │
//! │  ┌────────────────────┐               ┌────────────────────┐          │
//! │  │   StoreService     │  libp2p req   │     ProcNode       │          │
//! │  │                    │──────────────►│                    │          │
//! │  │ split / combine    │  descriptor   │ seal / open chunks │          │
//! │  │ catalog + layout   │◄──────────────│ key custody        │          │
//! │  └─────────┬──────────┘               └─────────┬──────────┘          │
//! │            │  bulk bytes over HTTP (Transport)  │                      │
//! │            └─────────────────◄──►───────────────┘                      │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  ┌────────────────────┐                                                │
//! │  │   ObjectStore      │  local SHA-256 store or IPFS                   │
//! │  └────────────────────┘                                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error type for the entire library
//! - [`config`] - Node configuration and repo layout
//! - [`context`] - Cancellation and deadlines
//! - [`crypto`] - Chunk sealing (AES-256-GCM)
//! - [`storage`] - Chunking, key custody, file catalog
//! - [`transfer`] - Bulk transfers described by descriptors
//! - [`network`] - libp2p request/response between nodes
//! - [`proc`] - The processing worker
//! - [`store`] - The store orchestrator
//!
//! ## Key Locality
//!
//! A chunk key never leaves the worker that generated it. The orchestrator
//! records which worker sealed each chunk and asks that worker first when
//! the chunk has to be opened again.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod network;
pub mod proc;
pub mod storage;
pub mod store;
pub mod transfer;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{Config, RepoLayout};
pub use context::{CancelHandle, Context};
pub use error::{Error, Result};
pub use proc::{ProcNode, ProcSettings};
pub use store::{StoreRequest, StoreService, StoreSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
