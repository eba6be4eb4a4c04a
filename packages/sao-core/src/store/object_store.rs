//! # Object Stores
//!
//! Content-addressed backends holding whole stored objects: the plaintext of
//! free files, the combined ciphertext blob of priced ones.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::storage::chunking::remove_quietly;

/// Byte stream handed to or returned by a store
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// What is being stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    /// Logical file id
    pub file_id: String,
    /// File name reported at upload
    pub filename: String,
    /// Bytes the reader will yield
    pub size: u64,
}

/// Where an object ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    /// Address to read the object back with
    pub content_address: String,
}

/// A content-addressed object backend
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store everything `reader` yields
    async fn store_file(&self, reader: ObjectReader, info: &StoreInfo) -> Result<StoreReceipt>;

    /// Stream the object at `content_address`
    async fn get_file(&self, content_address: &str) -> Result<ObjectReader>;

    /// Remove the object at `content_address`
    async fn delete_file(&self, content_address: &str) -> Result<()>;
}

/// Objects kept as files named by the hex SHA-256 of their content
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store rooted at `root`, created if missing
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, content_address: &str) -> Result<PathBuf> {
        let valid = content_address.len() == 64
            && content_address.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(Error::InvalidInput(format!(
                "invalid content address {:?}",
                content_address
            )));
        }
        Ok(self.root.join(content_address))
    }

    async fn write_temp(&self, reader: &mut ObjectReader, tmp: &Path, info: &StoreInfo) -> Result<String> {
        let mut out = tokio::fs::File::create(tmp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        out.flush().await?;
        out.sync_all().await?;

        if written != info.size {
            return Err(Error::ObjectStore(format!(
                "expected {} bytes for {}, got {}",
                info.size, info.file_id, written
            )));
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn store_file(&self, mut reader: ObjectReader, info: &StoreInfo) -> Result<StoreReceipt> {
        let tmp = self.root.join(format!(".incoming-{}", uuid::Uuid::new_v4()));
        let address = match self.write_temp(&mut reader, &tmp, info).await {
            Ok(address) => address,
            Err(e) => {
                remove_quietly(&tmp).await;
                return Err(e);
            }
        };

        let path = self.root.join(&address);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            remove_quietly(&tmp).await;
        } else {
            tokio::fs::rename(&tmp, &path).await?;
        }

        tracing::info!(file_id = %info.file_id, address = %address, size = info.size, "Object stored");
        Ok(StoreReceipt {
            content_address: address,
        })
    }

    async fn get_file(&self, content_address: &str) -> Result<ObjectReader> {
        let path = self.object_path(content_address)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", content_address)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, content_address: &str) -> Result<()> {
        let path = self.object_path(content_address)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", content_address)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
