//! Queue of raw uploads waiting for a chunking pass.

use anyhow::Result;
use rusqlite::{params, Row, Transaction};
use serde::Serialize;

use crate::index::{now_secs, Index};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BacklogEntry {
    pub id: i64,
    pub s3_file_path: String,
    pub study_id: String,
    pub participant_id: String,
    pub created_at: i64,
}

impl BacklogEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            s3_file_path: row.get("s3_file_path")?,
            study_id: row.get("study_id")?,
            participant_id: row.get("participant_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Backlog {
    index: Index,
}

impl Backlog {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    /// Queue a raw path. Returns false when it was already queued.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn enqueue(&self, s3_file_path: &str, study_id: &str, participant_id: &str) -> Result<bool> {
        self.index
            .with_immediate_tx(|tx| enqueue_tx(tx, s3_file_path, study_id, participant_id))
    }

    /// Up to `limit` entries with ids above `after_id`, oldest first.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn page(&self, after_id: i64, limit: usize) -> Result<Vec<BacklogEntry>> {
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, s3_file_path, study_id, participant_id, created_at \
             FROM files_to_process WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![after_id, limit], BacklogEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// # Errors
    /// Fails when the index cannot be written.
    pub fn remove(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.index.with_immediate_tx(|tx| {
            let mut stmt = tx.prepare("DELETE FROM files_to_process WHERE id = ?1")?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
            Ok(removed)
        })
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn len(&self) -> Result<u64> {
        let conn = self.index.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files_to_process", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) fn enqueue_tx(
    tx: &Transaction<'_>,
    s3_file_path: &str,
    study_id: &str,
    participant_id: &str,
) -> Result<bool> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO files_to_process(s3_file_path, study_id, participant_id, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![s3_file_path, study_id, participant_id, now_secs()],
    )?;
    Ok(inserted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn enqueue_is_idempotent_and_pages_in_order() -> Result<()> {
        let temp = tempdir()?;
        let backlog = Backlog::new(Index::open(temp.path())?);
        assert!(backlog.is_empty()?);
        for idx in 0..5 {
            assert!(backlog.enqueue(&format!("RAW_DATA/s/p/gps/{idx}.csv"), "s", "p")?);
        }
        assert!(!backlog.enqueue("RAW_DATA/s/p/gps/0.csv", "s", "p")?);
        assert_eq!(backlog.len()?, 5);

        let first = backlog.page(0, 2)?;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].s3_file_path, "RAW_DATA/s/p/gps/0.csv");
        let rest = backlog.page(first[1].id, 10)?;
        assert_eq!(rest.len(), 3);

        assert_eq!(backlog.remove(&[first[0].id, first[1].id])?, 2);
        assert_eq!(backlog.len()?, 3);
        Ok(())
    }
}
