//! # Storage
//!
//! A generic `Storage` trait exposing a very simple key/value API over raw bytes. It can be
//! implemented for any storage solution (databases, volatile memory, flat files, etc.).

/// Result type used by all the storage operations
pub type Result<T> = anyhow::Result<T>;

/// Iterator over the key/value pairs of a storage
pub type StorageIterator<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

/// Errors raised by the storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A thread panicked while holding the lock of an in-memory backend
    #[error("Storage lock poisoned")]
    LockPoisoned,
    /// Error reported by RocksDB
    #[cfg(feature = "rocksdb-backend")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

/// Key/value CRUD API for data storage
pub trait Storage {
    /// Retrieve an entry from the storage, identified by its key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Create / update an entry in the storage, identified by a key
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    /// Delete an entry from the storage, identified by its key
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterate over all the entries whose key starts with `prefix`, in ascending key order
    fn prefix_iterator<'a, 'b: 'a>(&'a self, prefix: &'b [u8]) -> Result<StorageIterator<'a>>;

    /// Iterate over all the entries whose key starts with `prefix`, in descending key order
    fn prefix_iterator_reverse<'a, 'b: 'a>(
        &'a self,
        prefix: &'b [u8],
    ) -> Result<StorageIterator<'a>> {
        let mut items: Vec<_> = self.prefix_iterator(prefix)?.collect();
        items.reverse();

        Ok(Box::new(items.into_iter()))
    }

    /// Atomically write a batch of operations
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

/// An operation of a `WriteBatch`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteBatchItem {
    /// Create / update an entry
    Put(Vec<u8>, Vec<u8>),
    /// Delete an entry
    Delete(Vec<u8>),
}

/// List of operations to be written atomically
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub(crate) batch: Vec<WriteBatchItem>,
}

impl WriteBatch {
    /// Queue a put operation
    pub fn put<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        self.batch.push(WriteBatchItem::Put(key.into(), value.into()));
    }

    /// Queue a delete operation
    pub fn delete<K>(&mut self, key: K)
    where
        K: Into<Vec<u8>>,
    {
        self.batch.push(WriteBatchItem::Delete(key.into()));
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// No operations queued
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Queued operations, in insertion order
    pub fn items(&self) -> &[WriteBatchItem] {
        &self.batch
    }
}

impl<S> Storage for Box<S>
where
    S: Storage + ?Sized,
{
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        (**self).delete(key)
    }

    fn prefix_iterator<'a, 'b: 'a>(&'a self, prefix: &'b [u8]) -> Result<StorageIterator<'a>> {
        (**self).prefix_iterator(prefix)
    }

    fn prefix_iterator_reverse<'a, 'b: 'a>(
        &'a self,
        prefix: &'b [u8],
    ) -> Result<StorageIterator<'a>> {
        (**self).prefix_iterator_reverse(prefix)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        (**self).write(batch)
    }
}
