//! Object store adapter.
//!
//! Wraps a [`BlobBackend`] with study namespacing, at-rest sealing and a
//! bounded retry loop. Callers never see sealed bytes.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::StoreConfig;

mod backend;
pub mod sealing;

pub use backend::{BackendError, BlobBackend, FsBackend, ListPage, MemoryBackend, Operation};

/// Source of per-study server keys.
pub trait StudyKeys: Send + Sync {
    /// # Errors
    /// Fails when the study is unknown or its key cannot be read.
    fn server_key(&self, study_id: &str) -> Result<[u8; sealing::SERVER_KEY_LEN]>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("[RD401] object '{0}' not found")]
    NotFound(String),
    #[error("[RD408] {op} '{key}' failed after {attempts} attempt(s): {source}")]
    Exhausted {
        op: &'static str,
        key: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },
    #[error("[RD409] {op} '{key}' failed permanently: {source}")]
    Rejected {
        op: &'static str,
        key: String,
        #[source]
        source: BackendError,
    },
    #[error("[RD413] object '{key}' could not be unsealed: {source}")]
    Unseal {
        key: String,
        #[source]
        source: sealing::SealError,
    },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "RD401",
            Self::Exhausted { .. } => "RD408",
            Self::Rejected { .. } => "RD409",
            Self::Unseal { .. } => "RD413",
        }
    }

    /// Whether a later attempt could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// True when `err` carries a transient [`StoreError`].
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(StoreError::is_transient)
}

/// True when `err` carries [`StoreError::NotFound`].
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(|store| matches!(store, StoreError::NotFound(_)))
}

/// A logical object location.
///
/// Namespaced keys are stored under `<study>/`; path-complete keys (those
/// that already embed the study, like `RAW_DATA/<study>/...`) are stored as
/// given. Both are sealed with the study's key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    study_id: String,
    key: String,
}

impl ObjectKey {
    #[must_use]
    pub fn namespaced(study_id: &str, path: &str) -> Self {
        Self {
            study_id: study_id.to_string(),
            key: format!("{study_id}/{path}"),
        }
    }

    #[must_use]
    pub fn path_complete(study_id: &str, key: &str) -> Self {
        Self {
            study_id: study_id.to_string(),
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn BlobBackend>,
    keys: Arc<dyn StudyKeys>,
    retries: u32,
    retry_delay: Duration,
    page_size: usize,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn BlobBackend>, keys: Arc<dyn StudyKeys>, config: &StoreConfig) -> Self {
        Self {
            backend,
            keys,
            retries: config.retries,
            retry_delay: config.retry_delay,
            page_size: config.list_page_size,
        }
    }

    /// Run `f` once plus up to `retries` more times on retryable errors,
    /// sleeping a fixed delay between attempts.
    fn with_retries<T>(
        &self,
        op: &'static str,
        key: &str,
        mut f: impl FnMut() -> Result<T, BackendError>,
    ) -> Result<T, StoreError> {
        let mut remaining = self.retries;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match f() {
                Ok(value) => return Ok(value),
                Err(BackendError::NotFound(missing)) => return Err(StoreError::NotFound(missing)),
                Err(err) if err.is_retryable() && remaining > 0 => {
                    remaining -= 1;
                    warn!(op, key, attempt = attempts, error = %err, "store operation failed; retrying");
                    if !self.retry_delay.is_zero() {
                        thread::sleep(self.retry_delay);
                    }
                }
                Err(err) if err.is_retryable() => {
                    return Err(StoreError::Exhausted {
                        op,
                        key: key.to_string(),
                        attempts,
                        source: err,
                    })
                }
                Err(err) => {
                    return Err(StoreError::Rejected {
                        op,
                        key: key.to_string(),
                        source: err,
                    })
                }
            }
        }
    }

    fn server_key(&self, key: &ObjectKey) -> Result<[u8; sealing::SERVER_KEY_LEN]> {
        self.keys
            .server_key(key.study_id())
            .with_context(|| format!("no server key for study {}", key.study_id()))
    }

    /// Fetch and unseal.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for absent objects, [`StoreError::Exhausted`]
    /// once retries run out.
    pub fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        let server_key = self.server_key(key)?;
        let sealed = self.with_retries("get", key.as_str(), || self.backend.get(key.as_str()))?;
        let plain = sealing::open(&server_key, &sealed).map_err(|source| StoreError::Unseal {
            key: key.as_str().to_string(),
            source,
        })?;
        debug!(key = key.as_str(), size = plain.len(), "object read");
        Ok(plain)
    }

    /// Seal and store.
    ///
    /// # Errors
    /// Fails when sealing fails or the backend keeps failing.
    pub fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<()> {
        let server_key = self.server_key(key)?;
        let sealed = sealing::seal(&server_key, bytes)
            .with_context(|| format!("failed to seal {}", key.as_str()))?;
        self.with_retries("put", key.as_str(), || self.backend.put(key.as_str(), &sealed))?;
        Ok(())
    }

    /// # Errors
    /// Fails when the backend keeps failing.
    pub fn exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.with_retries("exists", key.as_str(), || self.backend.exists(key.as_str()))?)
    }

    /// # Errors
    /// Fails when the backend keeps failing.
    pub fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.with_retries("delete", key.as_str(), || self.backend.delete(key.as_str()))?;
        Ok(())
    }

    /// Copy an object. Within one study the sealed bytes are copied as-is;
    /// across studies the object is re-sealed.
    ///
    /// # Errors
    /// Fails when the source is missing or the backend keeps failing.
    pub fn copy(&self, from: &ObjectKey, to: &ObjectKey) -> Result<()> {
        if from.study_id() == to.study_id() {
            self.with_retries("copy", from.as_str(), || {
                self.backend.copy(from.as_str(), to.as_str())
            })?;
            return Ok(());
        }
        let bytes = self.get(from)?;
        self.put(to, &bytes)
    }

    /// Copy then delete the source.
    ///
    /// # Errors
    /// As [`ObjectStore::copy`] and [`ObjectStore::delete`].
    pub fn move_object(&self, from: &ObjectKey, to: &ObjectKey) -> Result<()> {
        self.copy(from, to)?;
        self.delete(from)
    }

    /// Every key under `prefix`, fully materialized.
    ///
    /// # Errors
    /// Fails on the first page that cannot be listed.
    pub fn list(&self, prefix: &ObjectKey) -> Result<Vec<String>> {
        self.iter(prefix).collect()
    }

    /// Lazy listing. Each call starts from the beginning; pages are fetched
    /// as the iterator advances.
    #[must_use]
    pub fn iter(&self, prefix: &ObjectKey) -> ListIter<'_> {
        ListIter {
            store: self,
            prefix: prefix.as_str().to_string(),
            buffered: Vec::new().into_iter(),
            token: None,
            finished: false,
        }
    }
}

pub struct ListIter<'a> {
    store: &'a ObjectStore,
    prefix: String,
    buffered: std::vec::IntoIter<String>,
    token: Option<String>,
    finished: bool,
}

impl Iterator for ListIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffered.next() {
                return Some(Ok(key));
            }
            if self.finished {
                return None;
            }
            let page = self.store.with_retries("list", &self.prefix, || {
                self.store
                    .backend
                    .list_page(&self.prefix, self.token.as_deref(), self.store.page_size)
            });
            match page {
                Ok(page) => {
                    self.finished = page.next.is_none();
                    self.token = page.next;
                    self.buffered = page.keys.into_iter();
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use anyhow::{anyhow, Result};

    use super::{sealing, StudyKeys};

    /// Fixed keys for store tests.
    #[derive(Default)]
    pub(crate) struct StaticKeys {
        keys: HashMap<String, [u8; sealing::SERVER_KEY_LEN]>,
    }

    impl StaticKeys {
        pub(crate) fn with(studies: &[&str]) -> Self {
            Self {
                keys: studies
                    .iter()
                    .map(|study| ((*study).to_string(), sealing::generate_server_key()))
                    .collect(),
            }
        }
    }

    impl StudyKeys for StaticKeys {
        fn server_key(&self, study_id: &str) -> Result<[u8; sealing::SERVER_KEY_LEN]> {
            self.keys
                .get(study_id)
                .copied()
                .ok_or_else(|| anyhow!("unknown study {study_id}"))
        }
    }
}
