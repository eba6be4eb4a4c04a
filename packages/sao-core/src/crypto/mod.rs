//! # Cryptography Module
//!
//! Per-chunk authenticated encryption.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SEALED CHUNK LAYOUT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ┌────────────┬──────────────────────────────┬──────────────┐         │
//! │   │ nonce (12) │ ciphertext (len = plaintext) │ GCM tag (16) │         │
//! │   └────────────┴──────────────────────────────┴──────────────┘         │
//! │                                                                         │
//! │   Every chunk gets a fresh 256-bit key and a fresh random nonce.       │
//! │   The key never leaves the node that sealed the chunk.                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod encryption;

pub use encryption::{
    decrypt_file, encrypt_file, open, seal, sealed_size, ChunkKey, Nonce, SealedFile, KEY_SIZE,
    NONCE_SIZE, SEAL_OVERHEAD, TAG_SIZE,
};
pub(crate) use encryption::partial_path;
