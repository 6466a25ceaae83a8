//! Chunk registry: one metadata row per stored chunk.
//!
//! At most one live row exists per bucket for chunkable streams, enforced by
//! the `chunks_live_bucket` partial index. Every registration is a single
//! upsert so blob key, content hash, count and timestamp move together.
//!
//! A bucketed chunk keeps its canonical `chunk_path` for life, while its
//! content lives under a per-version `blob_key` derived from the content
//! hash. Switching versions is therefore one row update; the blob a row
//! names is never overwritten in place.

use anyhow::Result;
use rdx_domain::{
    chunk_hash, normalize_trailing_newline, observation_count, DataType, ParsedPath, TimeBin, TimeError,
    UploadBody,
};
use rusqlite::{params, params_from_iter, types::Type, types::Value, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::debug;

use crate::index::{now_secs, Index};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("[RD502] data type '{0}' is not chunkable")]
    UnchunkableDataType(DataType),
    #[error("[RD503] data type '{0}' is chunkable and cannot be registered unchunked")]
    ChunkableDataType(DataType),
}

impl ChunkError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnchunkableDataType(_) => "RD502",
            Self::ChunkableDataType(_) => "RD503",
        }
    }
}

/// Identity of one bucket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub study_id: String,
    pub participant_id: String,
    pub data_type: DataType,
    pub survey_id: Option<String>,
    pub time_bin: TimeBin,
}

impl ChunkKey {
    /// # Errors
    /// Fails when the bucket start cannot be formatted.
    pub fn chunk_path(&self) -> Result<String, TimeError> {
        rdx_domain::chunk_path(
            &self.study_id,
            &self.participant_id,
            self.data_type,
            self.survey_id.as_deref(),
            self.time_bin,
        )
    }

    fn survey_column(&self) -> &str {
        self.survey_id.as_deref().unwrap_or_default()
    }
}

/// Hex digits of the content hash that tag a blob version.
const VERSION_TAG_LEN: usize = 16;

/// Store key for one version of a bucketed chunk: the canonical path with a
/// content tag ahead of its extension.
#[must_use]
pub fn versioned_blob_key(chunk_path: &str, hash: &str) -> String {
    let tag = hash.get(..VERSION_TAG_LEN).unwrap_or(hash);
    match chunk_path.rsplit_once('.') {
        Some((stem, extension)) if !extension.contains('/') => format!("{stem}.{tag}.{extension}"),
        _ => format!("{chunk_path}.{tag}"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub study_id: String,
    pub participant_id: String,
    pub data_type: DataType,
    pub survey_id: Option<String>,
    pub time_bin: TimeBin,
    pub chunk_path: String,
    pub blob_key: String,
    pub chunk_hash: Option<String>,
    pub is_chunkable: bool,
    pub number_of_observations: u64,
    pub last_updated: i64,
}

const RECORD_COLUMNS: &str = "id, study_id, participant_id, data_type, survey_id, time_bin, chunk_path, \
     blob_key, chunk_hash, is_chunkable, number_of_observations, last_updated";

impl ChunkRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let data_type: String = row.get("data_type")?;
        let data_type = DataType::try_from(data_type.as_str())
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
        let survey_id: String = row.get("survey_id")?;
        let observations: i64 = row.get("number_of_observations")?;
        Ok(Self {
            id: row.get("id")?,
            study_id: row.get("study_id")?,
            participant_id: row.get("participant_id")?,
            data_type,
            survey_id: (!survey_id.is_empty()).then_some(survey_id),
            time_bin: TimeBin::from_start(row.get("time_bin")?),
            chunk_path: row.get("chunk_path")?,
            blob_key: row.get("blob_key")?,
            chunk_hash: row.get("chunk_hash")?,
            is_chunkable: row.get("is_chunkable")?,
            number_of_observations: u64::try_from(observations).unwrap_or(0),
            last_updated: row.get("last_updated")?,
        })
    }

    #[must_use]
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            study_id: self.study_id.clone(),
            participant_id: self.participant_id.clone(),
            data_type: self.data_type,
            survey_id: self.survey_id.clone(),
            time_bin: self.time_bin,
        }
    }
}

/// Filter for [`ChunkRegistry::query`]. Empty participant or data-type lists
/// match everything; the time range is inclusive on bucket starts.
#[derive(Clone, Debug, Default)]
pub struct ChunkQuery {
    pub study_id: String,
    pub participants: Vec<String>,
    pub data_types: Vec<DataType>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ChunkQuery {
    #[must_use]
    pub fn study(study_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            ..Self::default()
        }
    }
}

fn count_param(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upsert the live chunk for a bucket inside the caller's transaction.
/// Hash and count are taken from the normalized `content`.
pub(crate) fn register_chunked_tx(
    tx: &Transaction<'_>,
    key: &ChunkKey,
    chunk_path: &str,
    blob_key: &str,
    content: &[u8],
) -> Result<ChunkRecord> {
    if !key.data_type.is_chunkable() {
        return Err(ChunkError::UnchunkableDataType(key.data_type).into());
    }
    let normalized = normalize_trailing_newline(content);
    let hash = chunk_hash(&normalized);
    let observations = observation_count(&normalized);
    let record = tx.query_row(
        &format!(
            "INSERT INTO chunks(study_id, participant_id, data_type, survey_id, time_bin, chunk_path, \
             blob_key, chunk_hash, is_chunkable, number_of_observations, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10) \
             ON CONFLICT(study_id, participant_id, data_type, survey_id, time_bin) \
             WHERE deleted = 0 AND is_chunkable = 1 \
             DO UPDATE SET chunk_path = excluded.chunk_path, blob_key = excluded.blob_key, \
             chunk_hash = excluded.chunk_hash, number_of_observations = excluded.number_of_observations, \
             last_updated = excluded.last_updated \
             RETURNING {RECORD_COLUMNS}"
        ),
        params![
            key.study_id,
            key.participant_id,
            key.data_type.as_str(),
            key.survey_column(),
            key.time_bin.start(),
            chunk_path,
            blob_key,
            hash,
            count_param(observations),
            now_secs()
        ],
        ChunkRecord::from_row,
    )?;
    debug!(chunk_path, blob_key, observations, %hash, "chunk registered");
    Ok(record)
}

pub(crate) fn register_unchunked_tx(
    tx: &Transaction<'_>,
    parsed: &ParsedPath,
    time_bin: TimeBin,
    chunk_path: &str,
    content: &[u8],
) -> Result<ChunkRecord> {
    if parsed.data_type.is_chunkable() {
        return Err(ChunkError::ChunkableDataType(parsed.data_type).into());
    }
    let observations = UploadBody::classify(parsed.data_type, &parsed.extension, content.to_vec())
        .map_or(1, |body| body.observation_count());
    let record = tx.query_row(
        &format!(
            "INSERT INTO chunks(study_id, participant_id, data_type, survey_id, time_bin, chunk_path, \
             blob_key, chunk_hash, is_chunkable, number_of_observations, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL, 0, ?7, ?8) \
             ON CONFLICT(chunk_path) WHERE deleted = 0 \
             DO UPDATE SET time_bin = excluded.time_bin, \
             number_of_observations = excluded.number_of_observations, \
             last_updated = excluded.last_updated \
             RETURNING {RECORD_COLUMNS}"
        ),
        params![
            parsed.study_id,
            parsed.participant_id,
            parsed.data_type.as_str(),
            parsed.survey_id.as_deref().unwrap_or_default(),
            time_bin.start(),
            chunk_path,
            count_param(observations),
            now_secs()
        ],
        ChunkRecord::from_row,
    )?;
    debug!(chunk_path, observations, "unchunked file registered");
    Ok(record)
}

#[derive(Clone, Debug)]
pub struct ChunkRegistry {
    index: Index,
}

impl ChunkRegistry {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    /// The live chunk for a bucket, if any.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn find_live(&self, key: &ChunkKey) -> Result<Option<ChunkRecord>> {
        let conn = self.index.connection()?;
        conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM chunks \
                 WHERE study_id = ?1 AND participant_id = ?2 AND data_type = ?3 AND survey_id = ?4 \
                 AND time_bin = ?5 AND deleted = 0 AND is_chunkable = 1"
            ),
            params![
                key.study_id,
                key.participant_id,
                key.data_type.as_str(),
                key.survey_column(),
                key.time_bin.start()
            ],
            ChunkRecord::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Create or update the live chunk for a bucket from its full stored
    /// content, pointing it at `blob_key`.
    ///
    /// # Errors
    /// [`ChunkError::UnchunkableDataType`] for streams that are not bucketed.
    pub fn register_chunked(
        &self,
        key: &ChunkKey,
        chunk_path: &str,
        blob_key: &str,
        content: &[u8],
    ) -> Result<ChunkRecord> {
        self.index
            .with_immediate_tx(|tx| register_chunked_tx(tx, key, chunk_path, blob_key, content))
    }

    /// Register a file that is stored whole rather than bucketed. The
    /// content is passed in so its observations can be counted.
    ///
    /// # Errors
    /// [`ChunkError::ChunkableDataType`] for bucketed streams.
    pub fn register_unchunked(
        &self,
        parsed: &ParsedPath,
        time_bin: TimeBin,
        chunk_path: &str,
        content: &[u8],
    ) -> Result<ChunkRecord> {
        self.index
            .with_immediate_tx(|tx| register_unchunked_tx(tx, parsed, time_bin, chunk_path, content))
    }

    /// Live chunks matching `query`, ordered by bucket then path.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn query(&self, query: &ChunkQuery) -> Result<Vec<ChunkRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM chunks WHERE deleted = 0 AND study_id = ?1");
        let mut values: Vec<Value> = vec![Value::Text(query.study_id.clone())];
        if !query.participants.is_empty() {
            sql.push_str(&format!(
                " AND participant_id IN ({})",
                placeholders(values.len() + 1, query.participants.len())
            ));
            values.extend(query.participants.iter().cloned().map(Value::Text));
        }
        if !query.data_types.is_empty() {
            sql.push_str(&format!(
                " AND data_type IN ({})",
                placeholders(values.len() + 1, query.data_types.len())
            ));
            values.extend(
                query
                    .data_types
                    .iter()
                    .map(|data_type| Value::Text(data_type.as_str().to_string())),
            );
        }
        if let Some(start) = query.start {
            values.push(Value::Integer(start));
            sql.push_str(&format!(" AND time_bin >= ?{}", values.len()));
        }
        if let Some(end) = query.end {
            values.push(Value::Integer(end));
            sql.push_str(&format!(" AND time_bin <= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY time_bin, chunk_path");

        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), ChunkRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Overwrite a chunk's digest and count after a recount.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn update_counts(&self, id: i64, hash: &str, observations: u64) -> Result<()> {
        self.index.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE chunks SET chunk_hash = ?2, number_of_observations = ?3, last_updated = ?4 \
                 WHERE id = ?1",
                params![id, hash, count_param(observations), now_secs()],
            )?;
            Ok(())
        })
    }

    /// Retire a chunk. Rows are never physically removed.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn mark_deleted(&self, id: i64) -> Result<bool> {
        self.index.with_immediate_tx(|tx| {
            Ok(tx.execute(
                "UPDATE chunks SET deleted = 1, last_updated = ?2 WHERE id = ?1 AND deleted = 0",
                params![id, now_secs()],
            )? > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdx_domain::parse_file;
    use tempfile::tempdir;

    fn key(bin: i64) -> ChunkKey {
        ChunkKey {
            study_id: "s1".into(),
            participant_id: "p1".into(),
            data_type: DataType::Gps,
            survey_id: None,
            time_bin: TimeBin::from_start(bin),
        }
    }

    #[test]
    fn one_live_chunk_per_bucket() -> Result<()> {
        let temp = tempdir()?;
        let registry = ChunkRegistry::new(Index::open(temp.path())?);
        let key = key(1_609_459_200);
        let path = key.chunk_path()?;

        let first = registry.register_chunked(&key, &path, "v1", b"t,v\n1609459200,a\n\n\n")?;
        assert_eq!(first.number_of_observations, 1);
        assert_eq!(first.chunk_hash.as_deref(), Some(chunk_hash(b"t,v\n1609459200,a\n").as_str()));
        let second = registry.register_chunked(&key, &path, "v2", b"t,v\n1609459200,a\n1609459201,b\n")?;
        assert_eq!(second.id, first.id);
        assert_eq!(second.number_of_observations, 2);
        assert_eq!(second.chunk_path, path);
        assert_eq!(second.blob_key, "v2");
        assert_ne!(second.chunk_hash, first.chunk_hash);

        let live = registry.find_live(&key)?.unwrap();
        assert_eq!(live, second);
        assert_eq!(live.key(), key);

        assert!(registry.mark_deleted(live.id)?);
        assert!(registry.find_live(&key)?.is_none());
        let fresh = registry.register_chunked(&key, &path, "v3", b"t,v\n1609459200,a\n")?;
        assert_ne!(fresh.id, first.id);
        Ok(())
    }

    #[test]
    fn blob_versions_are_tagged_before_the_extension() {
        let hash = chunk_hash(b"h\n1\n");
        assert_eq!(
            versioned_blob_key("CHUNKED_DATA/s1/p1/gps/2021-01-01T00:00:00.csv", &hash),
            format!("CHUNKED_DATA/s1/p1/gps/2021-01-01T00:00:00.{}.csv", &hash[..16])
        );
        assert_eq!(versioned_blob_key("a.b/chunk", "abc"), "a.b/chunk.abc");
        assert_ne!(
            versioned_blob_key("c.csv", &hash),
            versioned_blob_key("c.csv", &chunk_hash(b"h\n2\n"))
        );
    }

    #[test]
    fn contract_errors_for_wrong_stream_class() -> Result<()> {
        let temp = tempdir()?;
        let registry = ChunkRegistry::new(Index::open(temp.path())?);
        let mut wrong = key(0);
        wrong.data_type = DataType::AudioRecordings;
        let err = registry.register_chunked(&wrong, "x", "x", b"").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ChunkError>(),
            Some(&ChunkError::UnchunkableDataType(DataType::AudioRecordings))
        );

        let parsed = parse_file("RAW_DATA/s1/p1/gps/1609459200000.csv")?;
        let err = registry
            .register_unchunked(&parsed, TimeBin::from_start(0), "x", b"")
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ChunkError>(),
            Some(&ChunkError::ChunkableDataType(DataType::Gps))
        );
        Ok(())
    }

    #[test]
    fn unchunked_files_count_by_content() -> Result<()> {
        let temp = tempdir()?;
        let registry = ChunkRegistry::new(Index::open(temp.path())?);
        let answers = parse_file("RAW_DATA/s1/p1/surveyAnswers/sv1/1609459200000.csv")?;
        let record = registry.register_unchunked(
            &answers,
            TimeBin::from_start(1_609_459_200),
            "CHUNKED_DATA/s1/p1/surveyAnswers/sv1/1609459200000.csv",
            b"q,a\n1,yes\n2,no\n",
        )?;
        assert_eq!(record.number_of_observations, 2);
        assert_eq!(record.survey_id.as_deref(), Some("sv1"));
        assert!(!record.is_chunkable);
        assert!(record.chunk_hash.is_none());
        assert_eq!(record.blob_key, record.chunk_path);

        let audio = parse_file("RAW_DATA/s1/p1/voiceRecording/sv2/1609459200000.mp4")?;
        let record = registry.register_unchunked(
            &audio,
            TimeBin::from_start(1_609_459_200),
            "CHUNKED_DATA/s1/p1/voiceRecording/sv2/1609459200000.mp4",
            &[0, 1, 2],
        )?;
        assert_eq!(record.number_of_observations, 1);
        Ok(())
    }

    #[test]
    fn query_filters_by_participant_type_and_range() -> Result<()> {
        let temp = tempdir()?;
        let registry = ChunkRegistry::new(Index::open(temp.path())?);
        for bin in [0, 3600, 7200] {
            let key = key(bin);
            let path = key.chunk_path()?;
            registry.register_chunked(&key, &path, &path, b"h\n1\n")?;
        }
        let mut other = key(3600);
        other.participant_id = "p2".into();
        other.data_type = DataType::Accelerometer;
        let path = other.chunk_path()?;
        registry.register_chunked(&other, &path, &path, b"h\n1\n")?;

        assert_eq!(registry.query(&ChunkQuery::study("s1"))?.len(), 4);
        assert!(registry.query(&ChunkQuery::study("s2"))?.is_empty());

        let ranged = registry.query(&ChunkQuery {
            start: Some(3600),
            end: Some(7200),
            ..ChunkQuery::study("s1")
        })?;
        assert_eq!(ranged.len(), 3);

        let filtered = registry.query(&ChunkQuery {
            participants: vec!["p1".into()],
            data_types: vec![DataType::Gps],
            end: Some(3600),
            ..ChunkQuery::study("s1")
        })?;
        assert_eq!(
            filtered.iter().map(|record| record.time_bin.start()).collect::<Vec<_>>(),
            vec![0, 3600]
        );
        Ok(())
    }
}
