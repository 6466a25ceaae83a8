//! Single-pass guard for the chunker.
//!
//! A row in `file_process_lock` means a pass is running. This is advisory:
//! it keeps a second pass from starting on the same index, nothing more.

use std::time::Duration;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::index::{now_secs, Index};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("[RD501] file processing is locked (held since {locked_at})")]
    FileProcessingLocked { locked_at: i64 },
}

impl LockError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileProcessingLocked { .. } => "RD501",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessingLock {
    index: Index,
}

impl ProcessingLock {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    /// # Errors
    /// [`LockError::FileProcessingLocked`] when a lock row already exists.
    pub fn lock(&self) -> Result<()> {
        self.index.with_immediate_tx(|tx| {
            let held: Option<i64> = tx
                .query_row("SELECT MIN(lock_time) FROM file_process_lock", [], |row| row.get(0))
                .optional()?
                .flatten();
            if let Some(locked_at) = held {
                return Err(LockError::FileProcessingLocked { locked_at }.into());
            }
            tx.execute(
                "INSERT INTO file_process_lock(lock_time) VALUES (?1)",
                params![now_secs()],
            )?;
            Ok(())
        })?;
        debug!("processing lock taken");
        Ok(())
    }

    /// Clear every lock row. Returns how many were removed.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn unlock(&self) -> Result<usize> {
        let removed = self
            .index
            .with_immediate_tx(|tx| Ok(tx.execute("DELETE FROM file_process_lock", [])?))?;
        debug!(removed, "processing lock cleared");
        Ok(removed)
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn locked_at(&self) -> Result<Option<i64>> {
        let conn = self.index.connection()?;
        Ok(conn
            .query_row("SELECT MIN(lock_time) FROM file_process_lock", [], |row| row.get(0))
            .optional()?
            .flatten())
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.locked_at()?.is_some())
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn time_since_locked(&self) -> Result<Option<Duration>> {
        Ok(self.locked_at()?.map(|locked_at| {
            Duration::from_secs(u64::try_from(now_secs().saturating_sub(locked_at)).unwrap_or(0))
        }))
    }

    /// Take the lock for the life of the returned guard.
    ///
    /// # Errors
    /// As [`ProcessingLock::lock`].
    pub fn acquire(&self) -> Result<LockGuard> {
        self.lock()?;
        Ok(LockGuard { lock: self.clone() })
    }
}

/// Releases the processing lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: ProcessingLock,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            warn!(error = %err, "failed to release processing lock");
        }
    }
}
