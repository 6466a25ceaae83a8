//! Blob backends: a filesystem tree and an in-memory map.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use fs4::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

const LOCKS_DIR: &str = ".locks";
const TMP_DIR: &str = ".tmp";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("[RD401] object '{0}' not found")]
    NotFound(String),
    #[error("[RD402] transient failure on '{key}': {reason}")]
    Transient { key: String, reason: String },
    #[error("[RD403] I/O failure on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("[RD404] invalid object key '{0}'")]
    InvalidKey(String),
}

impl BackendError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "RD401",
            Self::Transient { .. } => "RD402",
            Self::Io { .. } => "RD403",
            Self::InvalidKey(_) => "RD404",
        }
    }

    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Io { .. })
    }

    fn io(key: &str, source: io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound(key.to_string())
        } else {
            Self::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// One page of a listing. `next` is the token to pass as `start_after` for
/// the following page, absent on the last page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next: Option<String>,
}

/// Storage for opaque blobs addressed by slash-separated keys.
pub trait BlobBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError>;
    fn exists(&self, key: &str) -> Result<bool, BackendError>;
    fn copy(&self, from: &str, to: &str) -> Result<(), BackendError>;
    fn delete(&self, key: &str) -> Result<(), BackendError>;
    /// Keys starting with `prefix`, in lexicographic order, after `start_after`.
    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, BackendError>;
}

fn page_from_sorted<'a>(
    candidates: impl Iterator<Item = &'a String>,
    start_after: Option<&str>,
    limit: usize,
) -> ListPage {
    let mut keys: Vec<String> = candidates
        .filter(|key| start_after.map_or(true, |token| key.as_str() > token))
        .take(limit + 1)
        .cloned()
        .collect();
    let next = if keys.len() > limit {
        keys.truncate(limit);
        keys.last().cloned()
    } else {
        None
    };
    ListPage { keys, next }
}

/// Blobs as files under a root directory. Writes land in a temp file and are
/// renamed into place while holding a per-key lock file.
#[derive(Clone, Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// # Errors
    /// Fails when the root or its bookkeeping directories cannot be created.
    pub fn open(root: &Path) -> io::Result<Self> {
        for dir in [LOCKS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(LOCKS_DIR).join(format!("{digest}.lock"))
    }

    fn write_locked(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.object_path(key).map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(key))?;
        lock.lock_exclusive()?;
        let mut tmp = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|err| err.error)?;
        lock.unlock()?;
        Ok(())
    }
}

impl BlobBackend for FsBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.object_path(key)?;
        fs::read(path).map_err(|err| BackendError::io(key, err))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        self.object_path(key)?;
        self.write_locked(key, bytes)
            .map_err(|err| BackendError::io(key, err))?;
        debug!(key, size = bytes.len(), "object written");
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.object_path(key)?.is_file())
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), BackendError> {
        let bytes = self.get(from)?;
        self.put(to, &bytes)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.object_path(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::io(key, err)),
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, BackendError> {
        let base = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        if !base.is_dir() {
            return Ok(ListPage::default());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = entry.map_err(|err| BackendError::Io {
                key: prefix.to_string(),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with('.') || !key.starts_with(prefix) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(page_from_sorted(keys.iter(), start_after, limit))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Exists,
    Copy,
    Delete,
    List,
}

/// In-process backend with injectable transient failures.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<Operation, u32>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `op` fail transiently.
    pub fn fail_next(&self, op: Operation, count: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, count);
        }
    }

    /// Stored bytes for `key`, bypassing failure injection.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().map_or(0, |objects| objects.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, op: Operation, key: &str) -> Result<(), BackendError> {
        let mut failures = self.failures.lock().map_err(|_| poisoned(key))?;
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Transient {
                    key: key.to_string(),
                    reason: format!("injected {op:?} failure"),
                });
            }
        }
        Ok(())
    }

    fn objects(&self, key: &str) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, BackendError> {
        self.objects.lock().map_err(|_| poisoned(key))
    }
}

fn poisoned(key: &str) -> BackendError {
    BackendError::Transient {
        key: key.to_string(),
        reason: "memory backend lock poisoned".to_string(),
    }
}

impl BlobBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.check(Operation::Get, key)?;
        self.objects(key)?
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        self.check(Operation::Put, key)?;
        self.objects(key)?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.check(Operation::Exists, key)?;
        Ok(self.objects(key)?.contains_key(key))
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), BackendError> {
        self.check(Operation::Copy, from)?;
        let mut objects = self.objects(from)?;
        let bytes = objects
            .get(from)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), bytes);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check(Operation::Delete, key)?;
        self.objects(key)?.remove(key);
        Ok(())
    }

    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, BackendError> {
        self.check(Operation::List, prefix)?;
        let objects = self.objects(prefix)?;
        Ok(page_from_sorted(
            objects.keys().filter(|key| key.starts_with(prefix)),
            start_after,
            limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(backend: &dyn BlobBackend) {
        backend.put("s1/a/one.csv", b"1").unwrap();
        backend.put("s1/a/two.csv", b"2").unwrap();
        backend.put("s1/b/three.csv", b"3").unwrap();
        backend.put("s2/a/four.csv", b"4").unwrap();

        assert_eq!(backend.get("s1/a/two.csv").unwrap(), b"2");
        assert!(matches!(backend.get("s1/missing.csv"), Err(BackendError::NotFound(_))));
        assert!(backend.exists("s1/b/three.csv").unwrap());

        let first = backend.list_page("s1/", None, 2).unwrap();
        assert_eq!(first.keys, vec!["s1/a/one.csv", "s1/a/two.csv"]);
        let token = first.next.clone().unwrap();
        let second = backend.list_page("s1/", Some(&token), 2).unwrap();
        assert_eq!(second.keys, vec!["s1/b/three.csv"]);
        assert_eq!(second.next, None);

        backend.copy("s1/a/one.csv", "s1/c/one.csv").unwrap();
        assert_eq!(backend.get("s1/c/one.csv").unwrap(), b"1");
        backend.delete("s1/a/one.csv").unwrap();
        backend.delete("s1/a/one.csv").unwrap();
        assert!(!backend.exists("s1/a/one.csv").unwrap());
    }

    #[test]
    fn filesystem_backend_behaves_like_a_store() {
        let temp = tempdir().unwrap();
        let backend = FsBackend::open(temp.path()).unwrap();
        exercise(&backend);
        let listed = backend.list_page("", None, 100).unwrap();
        assert!(listed.keys.iter().all(|key| !key.starts_with('.')));
    }

    #[test]
    fn memory_backend_behaves_like_a_store() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn filesystem_backend_rejects_escaping_keys() {
        let temp = tempdir().unwrap();
        let backend = FsBackend::open(temp.path()).unwrap();
        assert!(matches!(backend.put("../x", b""), Err(BackendError::InvalidKey(_))));
        assert!(matches!(backend.get("/etc/passwd"), Err(BackendError::InvalidKey(_))));
        assert!(matches!(backend.get(".locks/x"), Err(BackendError::InvalidKey(_))));
    }

    #[test]
    fn injected_failures_are_transient_and_counted() {
        let backend = MemoryBackend::new();
        backend.put("k", b"v").unwrap();
        backend.fail_next(Operation::Get, 2);
        assert!(backend.get("k").unwrap_err().is_retryable());
        assert!(backend.get("k").is_err());
        assert_eq!(backend.get("k").unwrap(), b"v");
    }
}
