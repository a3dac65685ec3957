//! Key/value caches backing the registry fallbacks.
//!
//! Discovery results live in memory for the life of the process; config blobs
//! are written to disk so a restart can still come up while the registry is
//! down.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A shared key/value store. Entries never expire; a `set` replaces whatever
/// was stored under the key.
pub trait Cache<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V) -> Result<(), CacheError>;
}

/// In-process cache.
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Directory-backed text cache, one file per key.
///
/// Keys are percent-encoded into file names, so `config@svc-a` is stored as
/// `config%40svc-a`. Each write goes to its own temporary file that is then
/// renamed over the target, so readers never observe a half-written entry and
/// concurrent writers of one key never share a scratch file.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// The directory is created lazily on the first `set`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

impl Cache<String> for FileCache {
    fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache entry");
                None
            }
        }
    }

    fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(value.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(io_err(&tmp_path))?;

        let path = self.path_for(key);
        tmp.persist(&path)
            .map(drop)
            .map_err(|e| io_err(&path)(e.error))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError {
    let path = path.to_path_buf();
    move |source| CacheError::Io { path, source }
}

/// Percent-encodes every byte outside `[A-Za-z0-9_-]`. Dots are encoded too,
/// so no key maps onto `.` or `..`.
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}
