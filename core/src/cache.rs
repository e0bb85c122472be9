//! Persistent schema cache backed by `redb`.
//!
//! Two path-keyed tables:
//! - `shared-dir-files-hash`: path -> lowercase hex SHA-256
//! - `shared-dir-files-content`: path -> raw bytes
//!
//! Both records of a path are written and removed in one write transaction,
//! content first, so a hash record never exists without its content.
use crate::error::CacheError;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::debug;

const HASH_TABLE: TableDefinition<&str, &str> = TableDefinition::new("shared-dir-files-hash");
const CONTENT_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("shared-dir-files-content");

/// A cached (path, hash) pair as listed by `SchemaCache::entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub path: String,
    pub hash: String,
}

/// Content-hash-addressed store of shared schema files.
pub struct SchemaCache {
    db: Database,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SchemaCache {
    /// Create or open the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let cache = SchemaCache {
            db,
            path: Some(path.to_path_buf()),
        };
        cache.ensure_tables()?;
        debug!(path = %path.display(), "opened schema cache");
        Ok(cache)
    }

    /// A cache that lives only as long as this value.
    pub fn in_memory() -> Result<Self, CacheError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let cache = SchemaCache { db, path: None };
        cache.ensure_tables()?;
        Ok(cache)
    }

    /// Location of the database file, `None` for an in-memory cache.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ensure_tables(&self) -> Result<(), CacheError> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(HASH_TABLE)?;
            txn.open_table(CONTENT_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Every (path, hash) record, ordered by path.
    pub fn entries(&self) -> Result<Vec<CacheRecord>, CacheError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(HASH_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (path, hash) = item?;
            out.push(CacheRecord {
                path: path.value().to_string(),
                hash: hash.value().to_string(),
            });
        }
        Ok(out)
    }

    /// Stored hash for `path`.
    pub fn hash(&self, path: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(HASH_TABLE)?;
        Ok(table.get(path)?.map(|v| v.value().to_string()))
    }

    /// Stored bytes for `path`.
    pub fn content(&self, path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CONTENT_TABLE)?;
        Ok(table.get(path)?.map(|v| v.value().to_vec()))
    }

    /// Store `bytes` under `path` with its `hash`, replacing any previous entry.
    ///
    /// The caller is responsible for `hash` being the digest of `bytes`.
    pub fn put(&self, path: &str, hash: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let txn = self.db.begin_write()?;
        {
            let mut content = txn.open_table(CONTENT_TABLE)?;
            content.insert(path, bytes)?;
            let mut hashes = txn.open_table(HASH_TABLE)?;
            hashes.insert(path, hash)?;
        }
        txn.commit()?;
        debug!(path, hash, size = bytes.len(), "cached schema file");
        Ok(())
    }

    /// Remove both records of `path`. Returns whether anything was removed.
    pub fn remove(&self, path: &str) -> Result<bool, CacheError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut hashes = txn.open_table(HASH_TABLE)?;
            let had_hash = hashes.remove(path)?.is_some();
            let mut content = txn.open_table(CONTENT_TABLE)?;
            let had_content = content.remove(path)?.is_some();
            had_hash || had_content
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Number of cached files.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let cache = SchemaCache::in_memory().unwrap();
        assert!(cache.is_empty().unwrap());
        cache.put("default.yaml", "aa", b"schema_list: []").unwrap();
        assert_eq!(cache.hash("default.yaml").unwrap().as_deref(), Some("aa"));
        assert_eq!(
            cache.content("default.yaml").unwrap().as_deref(),
            Some(&b"schema_list: []"[..])
        );
        assert!(cache.remove("default.yaml").unwrap());
        assert!(cache.hash("default.yaml").unwrap().is_none());
        assert!(cache.content("default.yaml").unwrap().is_none());
        assert!(!cache.remove("default.yaml").unwrap());
    }

    #[test]
    fn put_replaces_instead_of_duplicating() {
        let cache = SchemaCache::in_memory().unwrap();
        cache.put("a", "h1", b"one").unwrap();
        cache.put("a", "h2", b"two").unwrap();
        let entries = cache.entries().unwrap();
        assert_eq!(
            entries,
            vec![CacheRecord {
                path: "a".into(),
                hash: "h2".into()
            }]
        );
        assert_eq!(cache.content("a").unwrap().unwrap(), b"two");
    }

    #[test]
    fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("cache.redb");
        {
            let cache = SchemaCache::open(&db_path).unwrap();
            cache.put("build/luna.bin", "ff", &[1, 2, 3]).unwrap();
        }
        let cache = SchemaCache::open(&db_path).unwrap();
        assert_eq!(cache.path(), Some(db_path.as_path()));
        assert_eq!(cache.content("build/luna.bin").unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn unusable_cache_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let err = SchemaCache::open(blocker.join("cache.redb")).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)), "unexpected error {:?}", err);
    }
}
