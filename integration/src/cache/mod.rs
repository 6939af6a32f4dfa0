//! Persistent cache of per-file data keyed by path and modification time.
//!
//! A record is valid only while the file's modification time, truncated to
//! whole seconds, equals the stored one. Sub-second precision is ignored since
//! file systems disagree about it. Records are persisted as JSON through a
//! [`CacheStore`] under a key prefix:
//!
//! - `{prefix}/enabled`: `true` or `false`
//! - `{prefix}/max_age_days`: days since last use before a record expires (0 = never)
//! - `{prefix}/records`: array of [`CacheRecord`]

mod store;


pub use store::{CacheStore, JsonFileStore, MemoryStore};

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of days an unused record survives.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 30;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No such file: {path}")]
    NoSuchFile { path: PathBuf },

    #[error("Failed to query modification time of '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupted file cache data under '{key}': {message}")]
    Corrupted { key: String, message: String },

    #[error("Cache store '{path}' failed: {message}")]
    Store { path: PathBuf, message: String },
}

/// One cached entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<T> {
    pub path: PathBuf,
    /// File modification time at the moment the record was added.
    pub modified: DateTime<Utc>,
    pub last_used: NaiveDate,
    pub data: T,
}

#[derive(Debug)]
struct CacheState<T> {
    records: HashMap<PathBuf, CacheRecord<T>>,
    enabled: bool,
    max_age_days: u32,
}

/// Thread-safe cache of per-file payloads.
#[derive(Debug)]
pub struct FileDataCache<T> {
    prefix: String,
    state: Mutex<CacheState<T>>,
}

impl<T> FileDataCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(CacheState {
                records: HashMap::new(),
                enabled: true,
                max_age_days: DEFAULT_MAX_AGE_DAYS,
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn max_age_days(&self) -> u32 {
        self.state.lock().max_age_days
    }

    pub fn set_max_age_days(&self, days: u32) {
        self.state.lock().max_age_days = days;
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    pub fn clear(&self) {
        self.state.lock().records.clear();
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.state.lock().records.remove(path).is_some()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().records.contains_key(path)
    }

    /// Inserts or replaces the record for `path`, stamped with the file's
    /// current modification time and today's date.
    pub fn add(&self, path: &Path, data: T) -> Result<(), CacheError> {
        let modified = file_modified(path)?;
        let record = CacheRecord {
            path: path.to_path_buf(),
            modified,
            last_used: today(),
            data,
        };
        self.state.lock().records.insert(path.to_path_buf(), record);
        Ok(())
    }

    /// Returns the payload for `path` if the file has not been modified since
    /// it was added. A stale record is evicted.
    pub fn get(&self, path: &Path) -> Result<Option<T>, CacheError> {
        let modified = file_modified(path)?;
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(path) else {
            return Ok(None);
        };
        if record.modified != modified {
            tracing::debug!(path = %path.display(), "Evicting stale cache record");
            state.records.remove(path);
            return Ok(None);
        }
        record.last_used = today();
        Ok(Some(record.data.clone()))
    }

    /// Replaces the in-memory state with the contents of `store`.
    ///
    /// Corrupted data clears every record and is reported; nothing is
    /// partially loaded. Records unused for more than `max_age_days` are
    /// dropped.
    pub fn load(&self, store: &dyn CacheStore) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        state.records.clear();

        if let Some(text) = store.read(&self.key("enabled"))? {
            state.enabled = self.parse(&self.key("enabled"), &text)?;
        }
        if let Some(text) = store.read(&self.key("max_age_days"))? {
            state.max_age_days = self.parse(&self.key("max_age_days"), &text)?;
        }
        if !state.enabled {
            return Ok(());
        }

        let Some(text) = store.read(&self.key("records"))? else {
            return Ok(());
        };
        let records: Vec<CacheRecord<T>> = self.parse(&self.key("records"), &text)?;

        let today = today();
        let max_age = i64::from(state.max_age_days);
        let total = records.len();
        state.records = records
            .into_iter()
            .filter(|r| max_age == 0 || (today - r.last_used).num_days() <= max_age)
            .map(|r| (r.path.clone(), r))
            .collect();

        tracing::debug!(
            prefix = %self.prefix,
            loaded = state.records.len(),
            expired = total - state.records.len(),
            "File cache loaded"
        );
        Ok(())
    }

    /// Writes settings and, if enabled, all records to `store`.
    pub fn save(&self, store: &mut dyn CacheStore) -> Result<(), CacheError> {
        let state = self.state.lock();
        store.write(&self.key("enabled"), &state.enabled.to_string())?;
        store.write(&self.key("max_age_days"), &state.max_age_days.to_string())?;

        if !state.enabled {
            return store.remove(&self.key("records"));
        }

        let mut records: Vec<&CacheRecord<T>> = state.records.values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let text = serde_json::to_string(&records).map_err(|e| CacheError::Corrupted {
            key: self.key("records"),
            message: e.to_string(),
        })?;
        store.write(&self.key("records"), &text)
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn parse<V: DeserializeOwned>(&self, key: &str, text: &str) -> Result<V, CacheError> {
        serde_json::from_str(text).map_err(|e| {
            tracing::warn!(key, error = %e, "Corrupted file cache data, discarding all records");
            CacheError::Corrupted {
                key: key.to_string(),
                message: e.to_string(),
            }
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Modification time of `path` truncated to whole seconds.
fn file_modified(path: &Path) -> Result<DateTime<Utc>, CacheError> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CacheError::NoSuchFile {
            path: path.to_path_buf(),
        },
        _ => CacheError::Metadata {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    let modified = metadata.modified().map_err(|e| CacheError::Metadata {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(DateTime::<Utc>::from(modified).trunc_subsecs(0))
}
