//! Key-value storage
//!
//! A named store of [`StoredValue`] records in a redb database, one table
//! per store. Reads are served from an in-memory cache loaded at open;
//! writes update the cache and are queued. Nothing reaches disk until
//! [`Storage::sync`], which flushes the queue in one transaction and
//! reloads the cache from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use tether_types::{StoredValue, Value};

use crate::error::StorageError;

enum Op {
    Set(String, Vec<u8>),
    Delete(String),
    Clear,
}

pub struct Storage {
    db: Database,
    path: PathBuf,
    name: String,
    cache: BTreeMap<String, StoredValue>,
    queued: Vec<Op>,
}

impl Storage {
    /// Open (or create) the store `name` in the database at `path`.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(redb::Error::Io(e)))?;
        }
        let db = Database::create(&path)?;

        // Ensure the table exists so plain reads never miss it.
        let txn = db.begin_write()?;
        txn.open_table(table(name))?;
        txn.commit()?;

        let mut storage = Self {
            db,
            path,
            name: name.to_string(),
            cache: BTreeMap::new(),
            queued: Vec::new(),
        };
        storage.reload()?;
        tracing::info!(
            "[storage:{}] opened {} ({} keys)",
            storage.name,
            storage.path.display(),
            storage.cache.len()
        );
        Ok(storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.cache.get(key) {
            Some(stored) => Ok(Some(stored.clone().into_value()?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Store a value. Encoding happens now, so an unsupported value fails
    /// here rather than at sync.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<(), StorageError> {
        let stored = StoredValue::from_value(value)?;
        let bytes = stored.to_json()?;
        self.cache.insert(key.to_string(), stored);
        self.queued.push(Op::Set(key.to_string(), bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.cache.remove(key).is_some();
        self.queued.push(Op::Delete(key.to_string()));
        existed
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.queued.push(Op::Clear);
    }

    pub fn keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Writes not yet flushed.
    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    /// Flush queued writes, then reload from disk. On failure the queue
    /// and the cache are left as they were, so a later sync can retry.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if !self.queued.is_empty() {
            self.flush()?;
            tracing::debug!("[storage:{}] flushed {} write(s)", self.name, self.queued.len());
            self.queued.clear();
        }
        self.reload()
    }

    fn flush(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut tbl = txn.open_table(table(&self.name))?;
            for op in &self.queued {
                match op {
                    Op::Set(key, bytes) => {
                        tbl.insert(key.as_str(), bytes.as_slice())?;
                    }
                    Op::Delete(key) => {
                        tbl.remove(key.as_str())?;
                    }
                    Op::Clear => {
                        let keys = tbl
                            .iter()?
                            .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                            .collect::<Result<Vec<_>, _>>()?;
                        for key in keys {
                            tbl.remove(key.as_str())?;
                        }
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), StorageError> {
        let txn = self.db.begin_read()?;
        let tbl = txn.open_table(table(&self.name))?;
        let mut cache = BTreeMap::new();
        for entry in tbl.iter()? {
            let (key, value) = entry?;
            cache.insert(key.value().to_string(), StoredValue::from_json(value.value())?);
        }
        self.cache = cache;
        Ok(())
    }
}

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}
