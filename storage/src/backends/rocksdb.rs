//! # Rocksdb storage backend
//!
//! Storage backend that persists data in the file system using a RocksDB database.
use std::path::Path;

use crate::storage::{Result, Storage, StorageError, StorageIterator, WriteBatch, WriteBatchItem};

/// Rocksdb backend
pub type Backend = rocksdb::DB;

/// Open the database at `path`, creating it if missing
pub fn open<P: AsRef<Path>>(path: P) -> Result<Backend> {
    log::debug!("Opening RocksDB database at {}", path.as_ref().display());
    let db = Backend::open_default(path).map_err(StorageError::from)?;

    Ok(db)
}

impl Storage for Backend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(Backend::get(self, key).map_err(StorageError::from)?)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        Backend::put(self, key, value).map_err(StorageError::from)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Backend::delete(self, key).map_err(StorageError::from)?;
        Ok(())
    }

    fn prefix_iterator<'a, 'b: 'a>(&'a self, prefix: &'b [u8]) -> Result<StorageIterator<'a>> {
        let mut items = vec![];
        for item in Backend::iterator(
            self,
            rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
        ) {
            let (k, v) = item.map_err(StorageError::from)?;
            if !k.starts_with(prefix) {
                break;
            }
            items.push((k.into_vec(), v.into_vec()));
        }

        Ok(Box::new(items.into_iter()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut rocksdb_batch = rocksdb::WriteBatch::default();

        for item in batch.batch {
            match item {
                WriteBatchItem::Put(key, value) => {
                    rocksdb_batch.put(key, value);
                }
                WriteBatchItem::Delete(key) => {
                    rocksdb_batch.delete(key);
                }
            }
        }

        Backend::write(self, rocksdb_batch).map_err(StorageError::from)?;

        Ok(())
    }
}
