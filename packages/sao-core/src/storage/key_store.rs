//! # Key Custody
//!
//! Maps `(file_id, size, offset)` of a sealed chunk to the key and nonce it
//! was sealed with.
//!
//! A key store belongs to exactly one node: the one that sealed the chunk.
//! Records carry that node's peer id as `custodian`, and a store refuses
//! records for any other custodian. Nothing here is replicated, so a chunk
//! can only be opened by asking its custodian.

use std::collections::HashMap;

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};

use super::database::{to_sql_u64, Database};
use crate::crypto::{ChunkKey, Nonce};
use crate::error::{Error, Result};

/// Key and nonce for one sealed chunk
#[derive(Debug, Clone)]
pub struct KeyRecord {
    /// Opaque record id, returned to the orchestrator as `FileKey`
    pub id: String,
    /// File the chunk belongs to
    pub file_id: String,
    /// Ciphertext offset of the chunk
    pub offset: u64,
    /// Sealed size of the chunk
    pub size: u64,
    /// AES-256 key
    pub key: ChunkKey,
    /// AES-GCM nonce
    pub nonce: Nonce,
    /// Peer id of the node that sealed the chunk
    pub custodian: String,
}

/// Lookup store for chunk keys, local to one node
pub trait KeyCustody: Send + Sync {
    /// Peer id this store holds keys for
    fn custodian(&self) -> &str;

    /// Record a key. Rejects records sealed by any other node.
    fn put(&self, record: &KeyRecord) -> Result<()>;

    /// Key for the chunk at `(file_id, size, offset)`
    fn get(&self, file_id: &str, size: u64, offset: u64) -> Result<KeyRecord>;
}

fn check_custodian(store: &str, record: &KeyRecord) -> Result<()> {
    if record.custodian != store {
        return Err(Error::InvalidInput(format!(
            "key record sealed by {} cannot be held by {}",
            record.custodian, store
        )));
    }
    Ok(())
}

fn not_found(file_id: &str, size: u64, offset: u64) -> Error {
    Error::KeyNotFound {
        file_id: file_id.to_string(),
        offset,
        size,
    }
}

// ============================================================================
// SQLITE
// ============================================================================

/// Key custody persisted in the node's `keystore.db`
#[derive(Debug, Clone)]
pub struct SqliteKeyStore {
    db: Database,
    custodian: String,
}

impl SqliteKeyStore {
    /// Wrap an open database for the given node identity
    pub fn new(db: Database, custodian: impl Into<String>) -> Self {
        Self {
            db,
            custodian: custodian.into(),
        }
    }
}

impl KeyCustody for SqliteKeyStore {
    fn custodian(&self) -> &str {
        &self.custodian
    }

    fn put(&self, record: &KeyRecord) -> Result<()> {
        check_custodian(&self.custodian, record)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO key_store (id, file_id, chunk_offset, chunk_size, key_bytes, nonce_bytes, custodian, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.file_id,
                to_sql_u64(record.offset)?,
                to_sql_u64(record.size)?,
                record.key.as_bytes().as_slice(),
                record.nonce.as_bytes().as_slice(),
                record.custodian,
                chrono::Utc::now().timestamp(),
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to store key: {}", e)))?;

        tracing::debug!(
            file_id = %record.file_id,
            offset = record.offset,
            size = record.size,
            "Stored chunk key"
        );
        Ok(())
    }

    fn get(&self, file_id: &str, size: u64, offset: u64) -> Result<KeyRecord> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT id, key_bytes, nonce_bytes, custodian FROM key_store
                 WHERE file_id = ? AND chunk_size = ? AND chunk_offset = ?
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![file_id, to_sql_u64(size)?, to_sql_u64(offset)?],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("Failed to look up key: {}", e)))?;

        let (id, key, nonce, custodian) = row.ok_or_else(|| not_found(file_id, size, offset))?;
        Ok(KeyRecord {
            id,
            file_id: file_id.to_string(),
            offset,
            size,
            key: ChunkKey::from_slice(&key)?,
            nonce: Nonce::from_slice(&nonce)?,
            custodian,
        })
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// Key custody held in memory
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    custodian: String,
    records: RwLock<HashMap<(String, u64, u64), KeyRecord>>,
}

impl MemoryKeyStore {
    /// Empty store for the given node identity
    pub fn new(custodian: impl Into<String>) -> Self {
        Self {
            custodian: custodian.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if no keys are held
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl KeyCustody for MemoryKeyStore {
    fn custodian(&self) -> &str {
        &self.custodian
    }

    fn put(&self, record: &KeyRecord) -> Result<()> {
        check_custodian(&self.custodian, record)?;
        self.records.write().insert(
            (record.file_id.clone(), record.size, record.offset),
            record.clone(),
        );
        Ok(())
    }

    fn get(&self, file_id: &str, size: u64, offset: u64) -> Result<KeyRecord> {
        self.records
            .read()
            .get(&(file_id.to_string(), size, offset))
            .cloned()
            .ok_or_else(|| not_found(file_id, size, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(custodian: &str, file_id: &str, offset: u64, size: u64) -> KeyRecord {
        KeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            offset,
            size,
            key: ChunkKey::generate(),
            nonce: Nonce::random(),
            custodian: custodian.into(),
        }
    }

    fn stores() -> Vec<Box<dyn KeyCustody>> {
        vec![
            Box::new(SqliteKeyStore::new(Database::open_in_memory().unwrap(), "peer-a")),
            Box::new(MemoryKeyStore::new("peer-a")),
        ]
    }

    #[test]
    fn test_put_get() {
        for store in stores() {
            let rec = record("peer-a", "file-1", 0, 5_242_908);
            store.put(&rec).unwrap();

            let found = store.get("file-1", 5_242_908, 0).unwrap();
            assert_eq!(found.id, rec.id);
            assert_eq!(found.key.as_bytes(), rec.key.as_bytes());
            assert_eq!(found.nonce, rec.nonce);
            assert_eq!(found.custodian, "peer-a");
        }
    }

    #[test]
    fn test_lookup_uses_full_triple() {
        for store in stores() {
            store.put(&record("peer-a", "file-1", 0, 100)).unwrap();

            assert!(matches!(store.get("file-1", 100, 128), Err(Error::KeyNotFound { .. })));
            assert!(matches!(store.get("file-1", 99, 0), Err(Error::KeyNotFound { .. })));
            assert!(matches!(store.get("file-2", 100, 0), Err(Error::KeyNotFound { .. })));
        }
    }

    #[test]
    fn test_foreign_custodian_rejected() {
        for store in stores() {
            let result = store.put(&record("peer-b", "file-1", 0, 100));
            assert!(matches!(result, Err(Error::InvalidInput(_))));
            assert!(store.get("file-1", 100, 0).is_err());
        }
    }

    #[test]
    fn test_concurrent_put_get() {
        let store = Arc::new(SqliteKeyStore::new(Database::open_in_memory().unwrap(), "peer-a"));
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let rec = record("peer-a", "file-c", i * 128, 128);
                    store.put(&rec).unwrap();
                    store.get("file-c", 128, i * 128).unwrap().id == rec.id
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
