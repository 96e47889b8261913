//! Durable unread badge counter, one integer per user.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("failed accessing counter file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed parsing counter file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("counter store backend failure: {0}")]
    Backend(String),
}

const COUNTER_KEY_PREFIX: &str = "unreadCount_";

/// Storage key for `user_id`'s counter.
pub fn counter_key(user_id: &str) -> String {
    format!("{COUNTER_KEY_PREFIX}{user_id}")
}

/// Persists the aggregate unread count so it survives a restart.
pub trait UnreadCounterStore: Send + Sync {
    /// Last saved value, `None` when nothing was saved.
    fn load(&self, user_id: &str) -> Result<Option<u64>, CounterStoreError>;

    fn save(&self, user_id: &str, total: u64) -> Result<(), CounterStoreError>;

    /// Drop every stored counter.
    fn clear_all(&self) -> Result<(), CounterStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl UnreadCounterStore for InMemoryCounterStore {
    fn load(&self, user_id: &str) -> Result<Option<u64>, CounterStoreError> {
        let counters = self
            .counters
            .read()
            .map_err(|_| CounterStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(counters.get(&counter_key(user_id)).copied())
    }

    fn save(&self, user_id: &str, total: u64) -> Result<(), CounterStoreError> {
        self.counters
            .write()
            .map_err(|_| CounterStoreError::Backend("poisoned lock".to_owned()))?
            .insert(counter_key(user_id), total);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), CounterStoreError> {
        self.counters
            .write()
            .map_err(|_| CounterStoreError::Backend("poisoned lock".to_owned()))?
            .clear();
        Ok(())
    }
}

/// JSON object of `unreadCount_<user>` keys stored in a single file.
///
/// Writes go through a temp file and a rename so a crash never leaves a
/// truncated file behind.
pub struct FileCounterStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, u64>, CounterStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(CounterStoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|source| CounterStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, u64>) -> bool,
    ) -> Result<(), CounterStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CounterStoreError::Backend("poisoned lock".to_owned()))?;
        let mut counters = self.read_all()?;
        if !apply(&mut counters) {
            return Ok(());
        }
        write_atomically(&self.path, &counters)
    }
}

impl UnreadCounterStore for FileCounterStore {
    fn load(&self, user_id: &str) -> Result<Option<u64>, CounterStoreError> {
        Ok(self.read_all()?.get(&counter_key(user_id)).copied())
    }

    fn save(&self, user_id: &str, total: u64) -> Result<(), CounterStoreError> {
        self.update(|counters| counters.insert(counter_key(user_id), total) != Some(total))
    }

    fn clear_all(&self) -> Result<(), CounterStoreError> {
        self.update(|counters| {
            let before = counters.len();
            counters.retain(|key, _| !key.starts_with(COUNTER_KEY_PREFIX));
            counters.len() != before
        })
    }
}

fn write_atomically(
    path: &Path,
    counters: &BTreeMap<String, u64>,
) -> Result<(), CounterStoreError> {
    let io_err = |source: io::Error| CounterStoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let encoded = serde_json::to_vec(counters).map_err(|source| CounterStoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, encoded).map_err(io_err)?;

    if fs::rename(&temp_path, path).is_err() {
        // Windows refuses to rename over an existing file.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(io_err(err));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            io_err(err)
        })?;
    }
    debug!(path = %path.display(), entries = counters.len(), "unread counters saved");
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("unread-counters.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
