//! # Chunk Encryption
//!
//! AES-256-GCM sealing of whole chunks, in memory and on disk.
//!
//! ## Chunk Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CHUNK SEAL / OPEN                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  encrypt_file(plain, out)                                              │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  key   = 32 random bytes (OsRng)                             │       │
//! │  │  nonce = 12 random bytes (OsRng)                             │       │
//! │  │  body  = nonce ‖ AES-256-GCM(key, nonce, plaintext)          │       │
//! │  │  write body to out.part, fsync, rename to out                │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  decrypt_file(sealed, out, key)                                        │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  split body into nonce (12) and ciphertext+tag               │       │
//! │  │  open with key; a bad tag aborts before anything is written  │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! | Property | Guarantee |
//! |----------|-----------|
//! | Confidentiality | Only the custodian of the chunk key can read it |
//! | Integrity | Any flipped byte in a sealed chunk fails the tag check |
//! | Isolation | Keys are per chunk, a leaked key exposes one chunk |

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of a chunk key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Bytes a sealed chunk carries on top of its plaintext
pub const SEAL_OVERHEAD: u64 = (NONCE_SIZE + TAG_SIZE) as u64;

/// Size of the sealed form of a `plaintext_len` byte chunk
pub fn sealed_size(plaintext_len: u64) -> u64 {
    plaintext_len + SEAL_OVERHEAD
}

/// A nonce (number used once) for AES-GCM encryption
///
/// Random 96-bit nonces are safe here because every key seals exactly
/// one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse stored nonce bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| {
            Error::Cipher(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM chunk key
///
/// Zeroized when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct ChunkKey([u8; KEY_SIZE]);

impl ChunkKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse stored key bytes, rejecting anything but 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::Cipher(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes, for persisting into key custody
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

/// Seal `plaintext` into `nonce ‖ ciphertext ‖ tag`
pub fn seal(key: &ChunkKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::Cipher(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: plaintext,
        aad: &[],
    };

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|e| Error::Cipher(format!("Encryption failed: {}", e)))?;

    let mut body = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    body.extend_from_slice(&nonce.0);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// Open a sealed body produced by [`seal`]
///
/// ## Errors
///
/// Returns `Cipher` if:
/// - The body is shorter than a nonce plus a tag
/// - The key is wrong
/// - Any byte of the body was modified
pub fn open(key: &ChunkKey, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Cipher(format!(
            "sealed body too short: {} bytes",
            body.len()
        )));
    }
    let (nonce, ciphertext) = body.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::Cipher(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: ciphertext,
        aad: &[],
    };

    cipher
        .decrypt(AesNonce::from_slice(nonce), payload)
        .map_err(|_| Error::Cipher("Decryption failed: authentication tag mismatch".into()))
}

/// Result of sealing a chunk file
#[derive(Debug)]
pub struct SealedFile {
    /// Fresh key the chunk was sealed with
    pub key: ChunkKey,
    /// Nonce prefixed to the sealed body
    pub nonce: Nonce,
    /// Where the sealed body was written
    pub path: PathBuf,
    /// Size of the sealed body
    pub size: u64,
}

/// Seal the file at `input` into `output` under a fresh key and nonce
///
/// The output is written to a sibling `.part` file and renamed into place,
/// so a failure never leaves a partial sealed chunk behind.
pub fn encrypt_file(input: &Path, output: &Path) -> Result<SealedFile> {
    let plaintext = fs::read(input)?;
    let key = ChunkKey::generate();
    let nonce = Nonce::random();
    let body = seal(&key, &nonce, &plaintext)?;

    write_atomically(output, &body)?;

    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        size = body.len(),
        "Sealed chunk"
    );

    Ok(SealedFile {
        key,
        nonce,
        path: output.to_path_buf(),
        size: body.len() as u64,
    })
}

/// Open the sealed file at `input` into `output`, returning the plaintext size
///
/// Nothing is written unless the tag verifies.
pub fn decrypt_file(input: &Path, output: &Path, key: &[u8]) -> Result<u64> {
    let key = ChunkKey::from_slice(key)?;
    let body = fs::read(input)?;
    let plaintext = open(&key, &body)?;

    write_atomically(output, &plaintext)?;

    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        size = plaintext.len(),
        "Opened chunk"
    );

    Ok(plaintext.len() as u64)
}

/// Sibling path used while a file is being produced
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = partial_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = ChunkKey::generate();
        let nonce = Nonce::random();
        let plaintext = b"chunk body";

        let body = seal(&key, &nonce, plaintext).unwrap();
        assert_eq!(body.len() as u64, sealed_size(plaintext.len() as u64));
        assert_eq!(&body[..NONCE_SIZE], nonce.as_bytes());

        let opened = open(&key, &body).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let body = seal(&ChunkKey::generate(), &Nonce::random(), b"secret").unwrap();
        let result = open(&ChunkKey::generate(), &body);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = ChunkKey::generate();
        let mut body = seal(&key, &Nonce::random(), b"secret message").unwrap();
        body[NONCE_SIZE + 2] ^= 0xFF;
        assert!(open(&key, &body).is_err());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = ChunkKey::generate();
        let mut body = seal(&key, &Nonce::random(), b"secret message").unwrap();
        body[0] ^= 0x01;
        assert!(open(&key, &body).is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        let key = ChunkKey::generate();
        let result = open(&key, &[0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(Error::Cipher(msg)) if msg.contains("too short")));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = ChunkKey::generate();
        let body = seal(&key, &Nonce::random(), b"").unwrap();
        assert_eq!(body.len() as u64, SEAL_OVERHEAD);
        assert!(open(&key, &body).unwrap().is_empty());
    }

    #[test]
    fn test_key_length_checked() {
        assert!(ChunkKey::from_slice(&[0u8; 16]).is_err());
        assert!(ChunkKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
        assert!(Nonce::from_slice(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_fresh_key_and_nonce_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain");
        fs::write(&input, b"same plaintext").unwrap();

        let a = encrypt_file(&input, &dir.path().join("a.encrypt")).unwrap();
        let b = encrypt_file(&input, &dir.path().join("b.encrypt")).unwrap();

        assert_ne!(a.key.as_bytes(), b.key.as_bytes());
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(fs::read(&a.path).unwrap(), fs::read(&b.path).unwrap());
    }

    #[test]
    fn test_file_encrypt_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain");
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&input, &plaintext).unwrap();

        let sealed = encrypt_file(&input, &dir.path().join("plain.encrypt")).unwrap();
        assert_eq!(sealed.size, sealed_size(plaintext.len() as u64));
        assert_eq!(fs::metadata(&sealed.path).unwrap().len(), sealed.size);

        let out = dir.path().join("plain.decrypt");
        let size = decrypt_file(&sealed.path, &out, sealed.key.as_bytes()).unwrap();
        assert_eq!(size, plaintext.len() as u64);
        assert_eq!(fs::read(&out).unwrap(), plaintext);
    }

    #[test]
    fn test_failed_decrypt_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain");
        fs::write(&input, b"payload").unwrap();
        let sealed = encrypt_file(&input, &dir.path().join("plain.encrypt")).unwrap();

        let mut body = fs::read(&sealed.path).unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x80;
        fs::write(&sealed.path, &body).unwrap();

        let out = dir.path().join("plain.decrypt");
        let result = decrypt_file(&sealed.path, &out, sealed.key.as_bytes());
        assert!(matches!(result, Err(Error::Cipher(_))));
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain");
        fs::write(&input, b"payload").unwrap();
        let sealed = encrypt_file(&input, &dir.path().join("plain.encrypt")).unwrap();

        let result = decrypt_file(&sealed.path, &dir.path().join("out"), &[1u8; 31]);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }
}
