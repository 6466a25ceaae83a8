//! Forensic records of decryption failures.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use super::{DecryptionFailure, LineFailure};
use crate::index::{now_secs, Index};

/// Sink for decryption failures. Implementations swallow their own errors.
pub trait FailureLedger: Send + Sync {
    fn record_line_failures(
        &self,
        participant_id: &str,
        file_name: &str,
        total_lines: usize,
        failures: &[LineFailure],
    );

    fn record_key_failure(
        &self,
        participant_id: &str,
        file_path: &str,
        contents: &[u8],
        failure: &DecryptionFailure,
    );
}

/// Writes failures to the index tables.
#[derive(Clone, Debug)]
pub struct IndexLedger {
    index: Index,
}

impl IndexLedger {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    fn insert_line_failures(
        &self,
        participant_id: &str,
        file_name: &str,
        total_lines: usize,
        failures: &[LineFailure],
    ) -> Result<()> {
        let now = now_secs();
        self.index.with_immediate_tx(|tx| {
            for failure in failures {
                tx.execute(
                    "INSERT INTO line_encryption_errors \
                     (type, line, base64_decryption_key, prev_line, next_line, participant_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        failure.kind.as_str(),
                        failure.line,
                        failure.key_b64,
                        failure.prev_line,
                        failure.next_line,
                        participant_id,
                        now
                    ],
                )?;
            }
            let error_lines: Vec<&str> = failures.iter().map(|failure| failure.line.as_str()).collect();
            let error_types: Vec<&str> = failures.iter().map(|failure| failure.kind.as_str()).collect();
            tx.execute(
                "INSERT INTO encryption_error_metadata \
                 (file_name, total_lines, number_errors, error_lines, error_types, participant_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file_name,
                    i64::try_from(total_lines).unwrap_or(i64::MAX),
                    i64::try_from(failures.len()).unwrap_or(i64::MAX),
                    json!(error_lines).to_string(),
                    json!(error_types).to_string(),
                    participant_id,
                    now
                ],
            )?;
            Ok(())
        })
    }

    fn insert_key_failure(
        &self,
        participant_id: &str,
        file_path: &str,
        contents: &[u8],
        failure: &DecryptionFailure,
    ) -> Result<()> {
        self.index.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO decryption_key_errors \
                 (file_path, contents, traceback, participant_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    file_path,
                    BASE64.encode(contents),
                    failure.to_string(),
                    participant_id,
                    now_secs()
                ],
            )?;
            Ok(())
        })
    }

    /// Counts of recorded failures.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn summary(&self) -> Result<LedgerSummary> {
        let conn = self.index.connection()?;
        let count = |table: &str| -> Result<u64> {
            let value: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(u64::try_from(value).unwrap_or(0))
        };
        Ok(LedgerSummary {
            line_errors: count("line_encryption_errors")?,
            files_with_line_errors: count("encryption_error_metadata")?,
            key_errors: count("decryption_key_errors")?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub line_errors: u64,
    pub files_with_line_errors: u64,
    pub key_errors: u64,
}

impl FailureLedger for IndexLedger {
    fn record_line_failures(
        &self,
        participant_id: &str,
        file_name: &str,
        total_lines: usize,
        failures: &[LineFailure],
    ) {
        if let Err(err) = self.insert_line_failures(participant_id, file_name, total_lines, failures) {
            warn!(participant_id, file_name, error = %err, "failed to record line decryption errors");
        }
    }

    fn record_key_failure(
        &self,
        participant_id: &str,
        file_path: &str,
        contents: &[u8],
        failure: &DecryptionFailure,
    ) {
        if let Err(err) = self.insert_key_failure(participant_id, file_path, contents, failure) {
            warn!(participant_id, file_path, error = %err, "failed to record decryption key error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LineErrorKind;
    use tempfile::tempdir;

    fn failure(index: usize) -> LineFailure {
        LineFailure {
            kind: LineErrorKind::PaddingError,
            index,
            line: format!("line{index}"),
            prev_line: String::new(),
            next_line: String::new(),
            key_b64: "a2V5".to_string(),
        }
    }

    #[test]
    fn records_lines_metadata_and_key_errors() -> Result<()> {
        let temp = tempdir()?;
        let ledger = IndexLedger::new(Index::open(temp.path())?);
        ledger.record_line_failures("p1", "p1_gps_1.csv", 5, &[failure(0), failure(3)]);
        ledger.record_key_failure("p1", "p1_gps_2.csv", b"garbage", &DecryptionFailure::InvalidKey {
            reason: "bad".into(),
        });
        assert_eq!(
            ledger.summary()?,
            LedgerSummary {
                line_errors: 2,
                files_with_line_errors: 1,
                key_errors: 1
            }
        );
        let types: String = ledger.index.connection()?.query_row(
            "SELECT error_types FROM encryption_error_metadata",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(types, r#"["PADDING_ERROR","PADDING_ERROR"]"#);
        Ok(())
    }

    #[test]
    fn recording_failures_never_panics_on_broken_index() -> Result<()> {
        let temp = tempdir()?;
        let index = Index::open(temp.path())?;
        index.connection()?.execute_batch("DROP TABLE line_encryption_errors")?;
        let ledger = IndexLedger::new(index);
        ledger.record_line_failures("p1", "f.csv", 1, &[failure(0)]);
        ledger.record_key_failure("p1", "f.csv", b"", &DecryptionFailure::EmptyEnvelope);
        Ok(())
    }
}
