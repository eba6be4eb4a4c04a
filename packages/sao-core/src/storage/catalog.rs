//! # File Catalog
//!
//! Records every stored file and, for encrypted files, the byte layout of
//! the combined ciphertext blob.
//!
//! ```text
//!  plaintext   [0 ────── p0) [p0 ─────── p0+p1)
//!                  │                │
//!                  ▼ seal           ▼ seal
//!  ciphertext  [0 ──── c0) [c0 ──── c0+c1)        c_i = p_i + 28
//! ```
//!
//! The layout is fixed at upload time. Downloads re-cut the blob along the
//! stored rows instead of splitting again.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::database::{to_sql_u64, Database};
use crate::crypto::sealed_size;
use crate::error::{Error, Result};

/// A stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Logical file id
    pub file_id: String,
    /// Original file name
    pub filename: String,
    /// MIME type reported at upload
    pub content_type: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// Price in the smallest currency unit; non-zero files are encrypted
    pub price: u64,
    /// Address of the stored object in the backing store
    pub content_address: String,
    /// Whether the stored object is a ciphertext blob
    pub encrypted: bool,
    /// Uploading client
    pub client_id: String,
    /// Unix timestamp (seconds) of the upload
    pub created_at: i64,
}

/// Placement of one chunk in plaintext and ciphertext coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// File the chunk belongs to
    pub file_id: String,
    /// Position of the chunk in split order
    pub index: usize,
    /// Offset in the original file
    pub plaintext_offset: u64,
    /// Size in the original file
    pub plaintext_size: u64,
    /// Offset in the combined ciphertext blob
    pub cipher_offset: u64,
    /// Sealed size
    pub cipher_size: u64,
    /// Peer that sealed the chunk and holds its key
    pub custodian: Option<String>,
}

/// Check that `layout` tiles both coordinate spaces from zero
///
/// Chunks must be ordered by ciphertext offset, contiguous and
/// non-overlapping in both spaces, and each sealed size must equal its
/// plaintext size plus the seal overhead. Returns the combined ciphertext
/// size.
pub fn validate_layout(layout: &[ChunkMetadata]) -> Result<u64> {
    if layout.is_empty() {
        return Err(Error::Decode("chunk layout is empty".into()));
    }

    let mut plain_end = 0u64;
    let mut cipher_end = 0u64;
    for (position, chunk) in layout.iter().enumerate() {
        if chunk.index != position {
            return Err(Error::Decode(format!(
                "chunk {} found at position {}",
                chunk.index, position
            )));
        }
        if chunk.plaintext_offset != plain_end {
            return Err(Error::Decode(format!(
                "chunk {} starts at plaintext offset {}, expected {}",
                chunk.index, chunk.plaintext_offset, plain_end
            )));
        }
        if chunk.cipher_offset != cipher_end {
            return Err(Error::Decode(format!(
                "chunk {} starts at ciphertext offset {}, expected {}",
                chunk.index, chunk.cipher_offset, cipher_end
            )));
        }
        if chunk.cipher_size != sealed_size(chunk.plaintext_size) {
            return Err(Error::Decode(format!(
                "chunk {} has sealed size {} for {} plaintext bytes",
                chunk.index, chunk.cipher_size, chunk.plaintext_size
            )));
        }
        plain_end += chunk.plaintext_size;
        cipher_end += chunk.cipher_size;
    }
    Ok(cipher_end)
}

/// Persisted file records and chunk layouts
pub trait FileCatalog: Send + Sync {
    /// Insert a new file record. An id already in the catalog is an error.
    fn put_file(&self, record: &FileRecord) -> Result<()>;

    /// Insert a new file record and its chunk layout in one transaction
    fn put_file_with_layout(&self, record: &FileRecord, layout: &[ChunkMetadata]) -> Result<()>;

    /// Look up a file record
    fn file(&self, file_id: &str) -> Result<Option<FileRecord>>;

    /// Delete a file record and its chunk layout. Returns whether it existed.
    fn delete_file(&self, file_id: &str) -> Result<bool>;

    /// Replace the chunk layout of a recorded file
    fn store_chunk_metadata(&self, file_id: &str, layout: &[ChunkMetadata]) -> Result<()>;

    /// Chunk layout of a file, ordered by ciphertext offset
    fn chunk_metadata(&self, file_id: &str) -> Result<Vec<ChunkMetadata>>;
}

/// Catalog persisted in the node's `catalog.db`
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    db: Database,
}

impl SqliteCatalog {
    /// Wrap an open database
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl FileCatalog for SqliteCatalog {
    fn put_file(&self, record: &FileRecord) -> Result<()> {
        let conn = self.db.conn();
        insert_file(&conn, record)
    }

    fn put_file_with_layout(&self, record: &FileRecord, layout: &[ChunkMetadata]) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        insert_file(&tx, record)?;
        insert_layout(&tx, &record.file_id, layout)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to store file record: {}", e)))?;
        Ok(())
    }

    fn file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT file_id, filename, content_type, size, price, content_address, encrypted, client_id, created_at
             FROM files WHERE file_id = ?",
            params![file_id],
            |row| {
                Ok(FileRecord {
                    file_id: row.get(0)?,
                    filename: row.get(1)?,
                    content_type: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                    price: row.get::<_, i64>(4)? as u64,
                    content_address: row.get(5)?,
                    encrypted: row.get(6)?,
                    client_id: row.get(7)?,
                    created_at: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("Failed to get file record: {}", e)))
    }

    fn delete_file(&self, file_id: &str) -> Result<bool> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunk_metadata WHERE file_id = ?", params![file_id])?;
        let removed = tx.execute("DELETE FROM files WHERE file_id = ?", params![file_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn store_chunk_metadata(&self, file_id: &str, layout: &[ChunkMetadata]) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunk_metadata WHERE file_id = ?", params![file_id])?;
        insert_layout(&tx, file_id, layout)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to store chunk metadata: {}", e)))?;
        Ok(())
    }

    fn chunk_metadata(&self, file_id: &str) -> Result<Vec<ChunkMetadata>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT chunk_index, plaintext_offset, plaintext_size, cipher_offset, cipher_size, custodian
             FROM chunk_metadata WHERE file_id = ? ORDER BY cipher_offset ASC",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok(ChunkMetadata {
                file_id: file_id.to_string(),
                index: row.get::<_, i64>(0)? as usize,
                plaintext_offset: row.get::<_, i64>(1)? as u64,
                plaintext_size: row.get::<_, i64>(2)? as u64,
                cipher_offset: row.get::<_, i64>(3)? as u64,
                cipher_size: row.get::<_, i64>(4)? as u64,
                custodian: row.get(5)?,
            })
        })?;

        let mut layout = Vec::new();
        for row in rows {
            layout.push(row?);
        }
        Ok(layout)
    }
}

fn insert_file(conn: &Connection, record: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO files
         (file_id, filename, content_type, size, price, content_address, encrypted, client_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.file_id,
            record.filename,
            record.content_type,
            to_sql_u64(record.size)?,
            to_sql_u64(record.price)?,
            record.content_address,
            record.encrypted,
            record.client_id,
            record.created_at,
        ],
    )
    .map_err(|e| Error::Database(format!("Failed to store file record: {}", e)))?;
    Ok(())
}

fn insert_layout(conn: &Connection, file_id: &str, layout: &[ChunkMetadata]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO chunk_metadata
         (file_id, chunk_index, plaintext_offset, plaintext_size, cipher_offset, cipher_size, custodian)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for chunk in layout {
        stmt.execute(params![
            file_id,
            chunk.index as i64,
            to_sql_u64(chunk.plaintext_offset)?,
            to_sql_u64(chunk.plaintext_size)?,
            to_sql_u64(chunk.cipher_offset)?,
            to_sql_u64(chunk.cipher_size)?,
            chunk.custodian,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SEAL_OVERHEAD;

    fn layout(file_id: &str, sizes: &[u64]) -> Vec<ChunkMetadata> {
        let mut plain = 0;
        let mut cipher = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| {
                let chunk = ChunkMetadata {
                    file_id: file_id.into(),
                    index,
                    plaintext_offset: plain,
                    plaintext_size: size,
                    cipher_offset: cipher,
                    cipher_size: size + SEAL_OVERHEAD,
                    custodian: Some("peer-a".into()),
                };
                plain += size;
                cipher += size + SEAL_OVERHEAD;
                chunk
            })
            .collect()
    }

    fn record(file_id: &str) -> FileRecord {
        FileRecord {
            file_id: file_id.into(),
            filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            size: 30,
            price: 5,
            content_address: "abc123".into(),
            encrypted: true,
            client_id: "client-1".into(),
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_validate_layout() {
        let chunks = layout("f", &[10, 20]);
        assert_eq!(validate_layout(&chunks).unwrap(), 30 + 2 * SEAL_OVERHEAD);
    }

    #[test]
    fn test_validate_layout_rejects_gap() {
        let mut chunks = layout("f", &[10, 20]);
        chunks[1].cipher_offset += 1;
        assert!(matches!(validate_layout(&chunks), Err(Error::Decode(_))));
    }

    #[test]
    fn test_validate_layout_rejects_overlap() {
        let mut chunks = layout("f", &[10, 20]);
        chunks[1].plaintext_offset -= 1;
        assert!(validate_layout(&chunks).is_err());
    }

    #[test]
    fn test_validate_layout_rejects_bad_seal_size() {
        let mut chunks = layout("f", &[10]);
        chunks[0].cipher_size = 10;
        assert!(validate_layout(&chunks).is_err());
        assert!(validate_layout(&[]).is_err());
    }

    #[test]
    fn test_file_record_round_trip() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());
        catalog.put_file(&record("f1")).unwrap();

        assert_eq!(catalog.file("f1").unwrap(), Some(record("f1")));
        assert_eq!(catalog.file("missing").unwrap(), None);
    }

    #[test]
    fn test_chunk_metadata_ordered_by_cipher_offset() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());
        catalog.put_file(&record("f1")).unwrap();

        let mut chunks = layout("f1", &[10, 20, 5]);
        chunks.reverse();
        catalog.store_chunk_metadata("f1", &chunks).unwrap();

        let stored = catalog.chunk_metadata("f1").unwrap();
        assert_eq!(stored, layout("f1", &[10, 20, 5]));
    }

    #[test]
    fn test_delete_cascades_metadata() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());
        catalog.put_file(&record("f1")).unwrap();
        catalog.store_chunk_metadata("f1", &layout("f1", &[10])).unwrap();

        assert!(catalog.delete_file("f1").unwrap());
        assert!(catalog.chunk_metadata("f1").unwrap().is_empty());
        assert!(!catalog.delete_file("f1").unwrap());
    }

    #[test]
    fn test_put_file_rejects_existing_id() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());
        catalog.put_file(&record("f1")).unwrap();

        let mut other = record("f1");
        other.content_address = "def456".into();
        assert!(matches!(catalog.put_file(&other), Err(Error::Database(_))));
        assert_eq!(catalog.file("f1").unwrap(), Some(record("f1")));
    }

    #[test]
    fn test_put_file_with_layout() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());
        catalog
            .put_file_with_layout(&record("f1"), &layout("f1", &[10, 20]))
            .unwrap();

        assert_eq!(catalog.file("f1").unwrap(), Some(record("f1")));
        assert_eq!(catalog.chunk_metadata("f1").unwrap(), layout("f1", &[10, 20]));
    }

    #[test]
    fn test_put_file_with_layout_is_atomic() {
        let catalog = SqliteCatalog::new(Database::open_in_memory().unwrap());

        // Duplicate chunk index violates the primary key after the record row
        let mut chunks = layout("f1", &[10, 20]);
        chunks[1].index = 0;
        assert!(catalog.put_file_with_layout(&record("f1"), &chunks).is_err());

        assert_eq!(catalog.file("f1").unwrap(), None);
        assert!(catalog.chunk_metadata("f1").unwrap().is_empty());
    }
}
