//! # BTreeMap storage backend
//!
//! Storage backend that keeps data in a heap-allocated BTreeMap.
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::storage::{Result, Storage, StorageError, StorageIterator, WriteBatch, WriteBatchItem};

/// BTreeMap backend
pub type Backend = RwLock<BTreeMap<Vec<u8>, Vec<u8>>>;

fn read(backend: &Backend) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
    Ok(backend.read().map_err(|_| StorageError::LockPoisoned)?)
}

fn write(backend: &Backend) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
    Ok(backend.write().map_err(|_| StorageError::LockPoisoned)?)
}

// Entries with this prefix, sorted by key. The entries are copied so that the lock is not held
// while iterating.
fn with_prefix(data: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    data.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(k, _v)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Storage for Backend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(read(self)?.get(key).map(|slice| slice.to_vec()))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        write(self)?.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        write(self)?.remove(key);
        Ok(())
    }

    fn prefix_iterator<'a, 'b: 'a>(&'a self, prefix: &'b [u8]) -> Result<StorageIterator<'a>> {
        let data = read(self)?;
        let items = with_prefix(&data, prefix);

        Ok(Box::new(items.into_iter()))
    }

    fn prefix_iterator_reverse<'a, 'b: 'a>(
        &'a self,
        prefix: &'b [u8],
    ) -> Result<StorageIterator<'a>> {
        let data = read(self)?;
        let items = with_prefix(&data, prefix);

        Ok(Box::new(items.into_iter().rev()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = write(self)?;

        for item in batch.batch {
            match item {
                WriteBatchItem::Put(key, value) => {
                    map.insert(key, value);
                }
                WriteBatchItem::Delete(key) => {
                    map.remove(&key);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Box<dyn Storage> {
        Box::new(Backend::default())
    }

    #[test]
    fn test_btreemap() {
        let storage = backend();

        assert_eq!(None, storage.get(b"name").unwrap());
        storage.put(b"name".to_vec(), b"john".to_vec()).unwrap();
        assert_eq!(Some("john".into()), storage.get(b"name").unwrap());
        storage.delete(b"name").unwrap();
        assert_eq!(None, storage.get(b"name").unwrap());
    }

    #[test]
    fn test_iterator_forward() {
        let storage = backend();

        storage
            .put(b"prefix-b".to_vec(), b"bob".to_vec())
            .unwrap();
        storage
            .put(b"prefix-a".to_vec(), b"alice".to_vec())
            .unwrap();
        storage.put(b"noprefix".to_vec(), b"eve".to_vec()).unwrap();
        storage.put(b"prefiz".to_vec(), b"zed".to_vec()).unwrap();

        let iter: Vec<_> = storage.prefix_iterator(b"prefix-").unwrap().collect();

        assert_eq!(
            iter,
            vec![
                (b"prefix-a".to_vec(), b"alice".to_vec()),
                (b"prefix-b".to_vec(), b"bob".to_vec())
            ]
        );
    }

    #[test]
    fn test_iterator_reverse() {
        let storage = backend();

        storage
            .put(b"prefix-a".to_vec(), b"alice".to_vec())
            .unwrap();
        storage.put(b"prefix-b".to_vec(), b"bob".to_vec()).unwrap();
        storage.put(b"noprefix".to_vec(), b"eve".to_vec()).unwrap();

        let iter: Vec<_> = storage
            .prefix_iterator_reverse(b"prefix-")
            .unwrap()
            .collect();

        assert_eq!(
            iter,
            vec![
                (b"prefix-b".to_vec(), b"bob".to_vec()),
                (b"prefix-a".to_vec(), b"alice".to_vec())
            ]
        );
    }

    #[test]
    fn test_write_batch() {
        let storage = backend();
        storage.put(b"stale".to_vec(), b"1".to_vec()).unwrap();

        let mut batch = WriteBatch::default();
        batch.put("a", "1");
        batch.put("b", "2");
        batch.delete("stale");
        batch.put("a", "3");
        assert_eq!(batch.len(), 4);
        storage.write(batch).unwrap();

        assert_eq!(storage.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(storage.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(storage.get(b"stale").unwrap(), None);
    }
}
