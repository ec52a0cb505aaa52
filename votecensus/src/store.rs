use crate::*;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Ordered iteration over a store, yielding key/value pairs in ascending key order
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KeyValue>> + 'a>;

/// A set of mutations applied atomically by [`Store::apply`]
#[derive(Default, Debug, Clone)]
pub struct Batch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch {
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push((key.into(), Some(value.into())));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push((key.into(), None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// An ordered, transactional key/value store
pub trait Store: Clone + Send + Sync + 'static {
    /// Get the value stored under a key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Atomically apply every mutation in the batch
    fn apply(&self, batch: Batch) -> Result<()>;

    /// Iterate over keys starting with `prefix`, beginning at `start` (inclusive)
    fn scan(&self, prefix: &[u8], start: &[u8]) -> KvIter<'_>;

    /// Derive an isolated child store
    fn namespace(&self, name: &str) -> Result<Self>;

    /// Remove all data of a child store
    fn drop_namespace(&self, name: &str) -> Result<()>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of keys starting with `prefix`
    fn count(&self, prefix: &[u8]) -> Result<usize> {
        let mut n = 0;
        for item in self.scan(prefix, prefix) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Open a write transaction
    fn write_tx(&self) -> WriteTx<'_, Self> {
        WriteTx {
            store: self,
            batch: Batch::default(),
        }
    }
}

/// Staged mutations against a store.
///
/// Nothing is visible until `commit`. Dropping an uncommitted transaction discards it.
pub struct WriteTx<'a, S: Store> {
    store: &'a S,
    batch: Batch,
}

impl<'a, S: Store> WriteTx<'a, S> {
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.batch.set(key, value)
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.batch.delete(key)
    }

    pub fn commit(self) -> Result<()> {
        self.store.apply(self.batch)
    }
}

/// A simple store that uses an in-memory BTreeMap
#[derive(Default, Clone)]
pub struct MemStore {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    prefix: Vec<u8>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }

    // Length prefixed so that "ab" and "abc" never overlap
    fn child_prefix(&self, name: &str) -> Vec<u8> {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&(name.len() as u32).to_be_bytes());
        prefix.extend_from_slice(name.as_bytes());
        prefix
    }

    /// Total number of keys across every namespace
    pub fn total_len(&self) -> usize {
        self.inner.read().len()
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(&self.full_key(key)).cloned())
    }

    fn apply(&self, batch: Batch) -> Result<()> {
        let mut inner = self.inner.write();
        for (key, value) in batch.ops {
            let key = self.full_key(&key);
            match value {
                Some(value) => {
                    inner.insert(key, value);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, prefix: &[u8], start: &[u8]) -> KvIter<'_> {
        let full_prefix = self.full_key(prefix);
        let start = self.full_key(start.max(prefix));
        let strip = self.prefix.len();

        // Collected under the read lock so the iteration sees a consistent snapshot
        let inner = self.inner.read();
        let items: Vec<KeyValue> = inner
            .range::<Vec<u8>, _>((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&full_prefix))
            .map(|(k, v)| (k[strip..].to_vec(), v.clone()))
            .collect();

        Box::new(items.into_iter().map(Ok))
    }

    fn namespace(&self, name: &str) -> Result<Self> {
        Ok(MemStore {
            inner: self.inner.clone(),
            prefix: self.child_prefix(name),
        })
    }

    fn drop_namespace(&self, name: &str) -> Result<()> {
        let prefix = self.child_prefix(name);
        let mut inner = self.inner.write();
        let doomed: Vec<Vec<u8>> = inner
            .range::<Vec<u8>, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.remove(&key);
        }
        Ok(())
    }
}

/// A persistent store backed by sled. Every namespace is its own sled tree.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
    name: String,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A store that is removed from disk once dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = (*db).clone();
        Ok(SledStore {
            db,
            tree,
            name: String::new(),
        })
    }

    fn child_name(&self, name: &str) -> String {
        if self.name.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", self.name, name)
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Store for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn apply(&self, batch: Batch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for (key, value) in batch.ops {
            match value {
                Some(value) => sled_batch.insert(key, value),
                None => sled_batch.remove(key),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        Ok(())
    }

    fn scan(&self, prefix: &[u8], start: &[u8]) -> KvIter<'_> {
        let prefix = prefix.to_vec();
        let start = start.max(&prefix[..]).to_vec();
        let iter = self
            .tree
            .range(start..)
            .take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(&prefix),
                Err(_) => true,
            })
            .map(|item| -> Result<KeyValue> {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            });
        Box::new(iter)
    }

    fn namespace(&self, name: &str) -> Result<Self> {
        let name = self.child_name(name);
        let tree = self.db.open_tree(name.as_bytes())?;
        Ok(SledStore {
            db: self.db.clone(),
            tree,
            name,
        })
    }

    fn drop_namespace(&self, name: &str) -> Result<()> {
        self.db.drop_tree(self.child_name(name).as_bytes())?;
        Ok(())
    }
}
