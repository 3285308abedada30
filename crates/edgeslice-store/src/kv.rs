use crate::Result;
use bytes::Bytes;

/// Key-value store underneath the resource store
pub trait KVStore: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a key-value pair
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Begin a write transaction. Write transactions are serialized, so a
    /// read-modify-write inside one is atomic.
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Transaction trait for atomic operations
pub trait Transaction: Send {
    /// Get a value by key, seeing this transaction's own writes
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Commit the transaction. Dropping it uncommitted discards its writes.
    fn commit(self: Box<Self>) -> Result<()>;
}
