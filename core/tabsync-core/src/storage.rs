//! Storage paths and the durable key-value store.
//!
//! ## Design Principles
//!
//! - **Single source of truth**: All path decisions centralized in `StorageConfig`
//! - **Whole-value writes**: Every write replaces the full value for its key;
//!   there is no merge. Each key has one writer in normal operation.
//! - **Graceful degradation**: Missing or corrupt entries read as absent, with
//!   a warning for corruption.
//!
//! # Atomic Writes
//!
//! `FileStore` writes through a temp file + rename so a crash mid-write leaves
//! the previous value intact rather than a truncated file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, SyncError};

const HOME_ENV: &str = "TABSYNC_HOME";
const APP_DIR: &str = "tabsync";

/// Central configuration for all tabsync storage paths.
///
/// Production code uses `StorageConfig::discover()`; tests use
/// `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Resolves the root from `TABSYNC_HOME`, falling back to the platform
    /// data directory.
    pub fn discover() -> Option<Self> {
        if let Ok(path) = std::env::var(HOME_ENV) {
            if !path.trim().is_empty() {
                return Some(Self::with_root(PathBuf::from(path)));
            }
        }
        dirs::data_dir().map(|dir| Self::with_root(dir.join(APP_DIR)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one JSON file per store key.
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Optional TOML file seeding settings on first run.
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("tabsync.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.store_dir(), self.log_dir()] {
            fs::create_dir_all(&dir).map_err(|source| SyncError::Io {
                context: format!("creating {}", dir.display()),
                source,
            })?;
        }
        Ok(())
    }
}

/// Keys of the durable store. Each one maps to a whole JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    CanvasTabs,
    ActiveContext,
    PreviousContext,
    PinnedTabs,
    ConnectionSettings,
    SyncSettings,
    Contexts,
}

impl StoreKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::CanvasTabs => "canvas-tabs",
            StoreKey::ActiveContext => "active-context",
            StoreKey::PreviousContext => "previous-context",
            StoreKey::PinnedTabs => "pinned-tabs",
            StoreKey::ConnectionSettings => "connection-settings",
            StoreKey::SyncSettings => "sync-settings",
            StoreKey::Contexts => "contexts",
        }
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

/// Process-wide durable key-value store.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: StoreKey) -> Result<Option<Value>>;
    fn write(&self, key: StoreKey, value: &Value) -> Result<()>;
    fn remove(&self, key: StoreKey) -> Result<()>;
}

impl<'a> dyn KeyValueStore + 'a {
    /// Reads and decodes a key. Values that no longer decode are treated as
    /// absent so a schema change cannot wedge startup.
    pub fn load<T: DeserializeOwned>(&self, key: StoreKey) -> Result<Option<T>> {
        let Some(value) = self.read(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "Discarding undecodable store entry");
                Ok(None)
            }
        }
    }

    pub fn save<T: Serialize + ?Sized>(&self, key: StoreKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| SyncError::Json {
            context: format!("encoding {}", key.as_str()),
            source,
        })?;
        self.write(key, &value)
    }
}

/// One pretty-printed JSON file per key under `StorageConfig::store_dir()`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open(storage: &StorageConfig) -> Result<Self> {
        storage.ensure_dirs()?;
        Ok(Self::new(storage.store_dir()))
    }

    fn path_for(&self, key: StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: StoreKey) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SyncError::Io {
                    context: format!("reading {}", key.as_str()),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring corrupt store file");
                Ok(None)
            }
        }
    }

    fn write(&self, key: StoreKey, value: &Value) -> Result<()> {
        let io_err = |source: std::io::Error| SyncError::Io {
            context: format!("writing {}", key.as_str()),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let payload = serde_json::to_vec_pretty(value).map_err(|source| SyncError::Json {
            context: format!("encoding {}", key.as_str()),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&payload).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(self.path_for(key))
            .map_err(|err| io_err(err.error))?;
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SyncError::Io {
                context: format!("removing {}", key.as_str()),
                source,
            }),
        }
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<StoreKey, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: StoreKey) -> Result<Option<Value>> {
        Ok(self.entries().get(&key).cloned())
    }

    fn write(&self, key: StoreKey, value: &Value) -> Result<()> {
        self.entries().insert(key, value.clone());
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<()> {
        self.entries().remove(&key);
        Ok(())
    }
}
