use crate::{KVStore, Result, StorageError, Transaction as KVTransaction};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const OBJECTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

/// redb-based storage backend
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create the database file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening redb database at: {}", path.as_ref().display());

        let db = Database::create(path.as_ref()).map_err(|e| {
            StorageError::database_error(
                format!("Failed to create database: {}", e),
                Some(Box::new(e)),
            )
        })?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OBJECTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        let value = table.get(key)?.map(|v| Bytes::from(v.value().to_vec()));
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        debug!("Putting key: {:?}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        debug!("Deleting key: {:?}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        let mut results = Vec::new();
        // Keys are ordered, so everything under the prefix is one contiguous run
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key_bytes = key.value();
            if !key_bytes.starts_with(prefix) {
                break;
            }
            results.push((
                Bytes::from(key_bytes.to_vec()),
                Bytes::from(value.value().to_vec()),
            ));
        }

        debug!(
            "Scan of {:?} found {} entries",
            String::from_utf8_lossy(prefix),
            results.len()
        );
        Ok(results)
    }

    fn transaction(&self) -> Result<Box<dyn KVTransaction>> {
        let write_txn = self.db.begin_write()?;
        Ok(Box::new(RedbTransaction {
            txn: Some(write_txn),
        }))
    }
}

/// redb write transaction; aborted on drop unless committed
struct RedbTransaction {
    txn: Option<redb::WriteTransaction>,
}

impl RedbTransaction {
    fn txn(&self) -> Result<&redb::WriteTransaction> {
        self.txn.as_ref().ok_or_else(|| {
            StorageError::transaction_error("Transaction already committed")
        })
    }
}

impl KVTransaction for RedbTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let table = self.txn()?.open_table(OBJECTS_TABLE)?;
        let value = table.get(key)?.map(|v| Bytes::from(v.value().to_vec()));
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.txn()?.open_table(OBJECTS_TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut table = self.txn()?.open_table(OBJECTS_TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| {
            StorageError::transaction_error("Transaction already committed")
        })?;
        txn.commit()?;
        Ok(())
    }
}

impl Drop for RedbTransaction {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_backend_basic_operations() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(b"v1/Node/node-1", b"{}").unwrap();
        assert_eq!(
            backend.get(b"v1/Node/node-1").unwrap(),
            Some(Bytes::from("{}"))
        );
        assert_eq!(backend.get(b"v1/Node/node-2").unwrap(), None);

        backend.delete(b"v1/Node/node-1").unwrap();
        assert_eq!(backend.get(b"v1/Node/node-1").unwrap(), None);
    }

    #[test]
    fn test_scan_stops_at_prefix_boundary() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(b"v1/Pod/lab/a", b"1").unwrap();
        backend.put(b"v1/Pod/lab/b", b"2").unwrap();
        backend.put(b"v1/Pod/lab-a/c", b"3").unwrap();
        backend.put(b"v1/Node/n", b"4").unwrap();

        let results = backend.scan(b"v1/Pod/lab/").unwrap();
        let keys: Vec<_> = results.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![Bytes::from("v1/Pod/lab/a"), Bytes::from("v1/Pod/lab/b")]
        );
        assert_eq!(backend.scan(b"v1/Pod/").unwrap().len(), 3);
    }

    #[test]
    fn test_transaction_commit_and_drop() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        let mut txn = backend.transaction().unwrap();
        txn.put(b"key1", b"value1").unwrap();
        // Reads inside the transaction see its own writes
        assert_eq!(txn.get(b"key1").unwrap(), Some(Bytes::from("value1")));
        txn.commit().unwrap();
        assert_eq!(backend.get(b"key1").unwrap(), Some(Bytes::from("value1")));

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(b"key2", b"value2").unwrap();
            txn.delete(b"key1").unwrap();
            // dropped without commit
        }
        assert_eq!(backend.get(b"key2").unwrap(), None);
        assert_eq!(backend.get(b"key1").unwrap(), Some(Bytes::from("value1")));
    }
}
