//! Durable key/value stores backing the file data cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::CacheError;

/// String-keyed persistent settings storage.
pub trait CacheStore {
    fn read(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn write(&mut self, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove(&mut self, key: &str) -> Result<(), CacheError>;
}

/// Volatile store, mostly useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.values.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Settings file on disk: one JSON object mapping keys to string values.
///
/// Every write rewrites the whole file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, CacheError> {
        common::serde::read_json_file(&self.path)
            .map(Option::unwrap_or_default)
            .map_err(|e| CacheError::Store {
                path: self.path.clone(),
                message: format!("{e:#}"),
            })
    }

    fn store(&self, values: &BTreeMap<String, String>) -> Result<(), CacheError> {
        common::serde::write_json_file(&self.path, values).map_err(|e| CacheError::Store {
            path: self.path.clone(),
            message: format!("{e:#}"),
        })
    }
}

impl CacheStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.load()?.remove(key))
    }

    fn write(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.store(&values)
    }

    fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.store(&values)?;
        }
        Ok(())
    }
}
