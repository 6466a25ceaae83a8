//! The chunking pass.
//!
//! A pass holds the processing lock, pages through the backlog and works
//! each page in two parallel stages on a bounded pool:
//!
//! 1. every entry is fetched and split into per-bucket contributions;
//! 2. contributions are grouped by bucket and each bucket is merged by
//!    exactly one worker.
//!
//! A merged bucket goes to a fresh content-tagged blob. One immediate
//! transaction then points the registry row at it and adds the merged rows
//! to the hourly statistics; the superseded blob is deleted only after that
//! commit. A pass that dies anywhere in between leaves the row naming a
//! complete blob whose hash it records, at worst with an orphaned blob. An
//! entry leaves the backlog only once every bucket it fed has been merged,
//! or when it can never be chunked.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rdx_domain::{
    chunk_hash, normalize_trailing_newline, parse, unchunked_chunk_path, ChunkHasher, DataType, ParsedPath,
    PathRecord, TabularBody, TimeBin,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backlog::{Backlog, BacklogEntry};
use crate::chunks::{
    register_chunked_tx, register_unchunked_tx, versioned_blob_key, ChunkKey, ChunkQuery, ChunkRegistry,
};
use crate::config::ChunkingConfig;
use crate::index::Index;
use crate::lock::ProcessingLock;
use crate::stats::add_observations_tx;
use crate::store::{is_not_found, ObjectKey, ObjectStore, StoreError};

const RECOUNT_PIECE: usize = 64 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Entries fully incorporated and removed from the backlog.
    pub entries_processed: u64,
    /// Entries that can never be chunked; removed.
    pub entries_skipped: u64,
    /// Entries left in the backlog for the next pass.
    pub entries_retained: u64,
    pub chunks_created: u64,
    pub chunks_updated: u64,
    pub chunks_unchanged: u64,
    pub unchunked_registered: u64,
    pub rows_dropped: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecountSummary {
    pub checked: u64,
    pub updated: u64,
    pub missing: u64,
}

struct Contribution {
    key: ChunkKey,
    header: String,
    rows: Vec<String>,
}

enum Prepared {
    Bucketed {
        contributions: Vec<Contribution>,
        dropped: usize,
    },
    Unchunked {
        parsed: ParsedPath,
        bytes: Vec<u8>,
    },
    Skip(String),
    Retry(anyhow::Error),
}

struct Bucket {
    header: String,
    rows: Vec<String>,
    sources: Vec<i64>,
}

enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Store failures that no retry will fix.
fn is_permanent(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(|store| !store.is_transient())
}

pub struct Chunker {
    index: Index,
    store: ObjectStore,
    registry: ChunkRegistry,
    backlog: Backlog,
    lock: ProcessingLock,
    config: ChunkingConfig,
}

impl Chunker {
    #[must_use]
    pub fn new(index: &Index, store: ObjectStore, config: ChunkingConfig) -> Self {
        Self {
            index: index.clone(),
            store,
            registry: ChunkRegistry::new(index.clone()),
            backlog: Backlog::new(index.clone()),
            lock: ProcessingLock::new(index.clone()),
            config,
        }
    }

    /// Drain the backlog once.
    ///
    /// # Errors
    /// [`crate::lock::LockError::FileProcessingLocked`] when another pass
    /// holds the lock; index failures abort the pass. Per-entry failures
    /// are logged and counted, not returned.
    pub fn run_pass(&self) -> Result<PassSummary> {
        let _guard = self.lock.acquire()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.max(1))
            .thread_name(|idx| format!("rdx-chunk-{idx}"))
            .build()
            .context("failed to build chunking worker pool")?;

        let mut summary = PassSummary::default();
        let mut after_id = 0;
        loop {
            let page = self.backlog.page(after_id, self.config.page_size.max(1))?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            debug!(entries = page.len(), after_id, "chunking backlog page");
            let finished = pool.install(|| self.process_page(&page, &mut summary));
            self.backlog.remove(&finished)?;
        }
        info!(
            processed = summary.entries_processed,
            skipped = summary.entries_skipped,
            retained = summary.entries_retained,
            created = summary.chunks_created,
            updated = summary.chunks_updated,
            "chunking pass finished"
        );
        Ok(summary)
    }

    /// Work one page; returns the ids that may leave the backlog.
    fn process_page(&self, page: &[BacklogEntry], summary: &mut PassSummary) -> Vec<i64> {
        let prepared: Vec<Prepared> = page.par_iter().map(|entry| self.prepare(entry)).collect();

        let mut finished = Vec::new();
        let mut buckets: BTreeMap<ChunkKey, Bucket> = BTreeMap::new();
        let mut bucketed: BTreeSet<i64> = BTreeSet::new();
        let mut unchunked = Vec::new();
        for (entry, prepared) in page.iter().zip(prepared) {
            match prepared {
                Prepared::Bucketed { contributions, dropped } => {
                    summary.rows_dropped += dropped as u64;
                    for contribution in contributions {
                        let bucket = buckets.entry(contribution.key).or_insert_with(|| Bucket {
                            header: contribution.header,
                            rows: Vec::new(),
                            sources: Vec::new(),
                        });
                        bucket.rows.extend(contribution.rows);
                        bucket.sources.push(entry.id);
                    }
                    bucketed.insert(entry.id);
                }
                Prepared::Unchunked { parsed, bytes } => unchunked.push((entry, parsed, bytes)),
                Prepared::Skip(reason) => {
                    warn!(path = %entry.s3_file_path, %reason, "backlog entry cannot be chunked; dropping");
                    summary.entries_skipped += 1;
                    finished.push(entry.id);
                }
                Prepared::Retry(err) => {
                    warn!(path = %entry.s3_file_path, error = %format!("{err:#}"), "backlog entry deferred");
                    summary.entries_retained += 1;
                }
            }
        }

        let merges: Vec<(Vec<i64>, Option<MergeOutcome>)> = buckets
            .into_par_iter()
            .map(|(key, bucket)| {
                let outcome = match self.merge_bucket(&key, &bucket.header, &bucket.rows) {
                    Ok(outcome) => Some(outcome),
                    Err(err) => {
                        warn!(
                            participant_id = %key.participant_id,
                            data_type = %key.data_type,
                            time_bin = %key.time_bin,
                            error = %format!("{err:#}"),
                            "chunk merge failed"
                        );
                        None
                    }
                };
                (bucket.sources, outcome)
            })
            .collect();
        let mut failed: HashSet<i64> = HashSet::new();
        for (sources, outcome) in merges {
            match outcome {
                Some(MergeOutcome::Created) => summary.chunks_created += 1,
                Some(MergeOutcome::Updated) => summary.chunks_updated += 1,
                Some(MergeOutcome::Unchanged) => summary.chunks_unchanged += 1,
                None => failed.extend(sources),
            }
        }
        for id in bucketed {
            if failed.contains(&id) {
                summary.entries_retained += 1;
            } else {
                summary.entries_processed += 1;
                finished.push(id);
            }
        }

        let registered: Vec<(i64, bool)> = unchunked
            .into_par_iter()
            .map(|(entry, parsed, bytes)| match self.store_unchunked(entry, &parsed, &bytes) {
                Ok(()) => (entry.id, true),
                Err(err) => {
                    warn!(path = %entry.s3_file_path, error = %format!("{err:#}"), "unchunked registration failed");
                    (entry.id, false)
                }
            })
            .collect();
        for (id, ok) in registered {
            if ok {
                summary.unchunked_registered += 1;
                summary.entries_processed += 1;
                finished.push(id);
            } else {
                summary.entries_retained += 1;
            }
        }
        finished
    }

    fn prepare(&self, entry: &BacklogEntry) -> Prepared {
        let parsed = match parse(&entry.s3_file_path) {
            Ok(PathRecord::File(parsed)) => parsed,
            Ok(PathRecord::RegistrationMarker { .. }) => {
                return Prepared::Skip("registration marker carries no data".into())
            }
            Err(err) => return Prepared::Skip(err.to_string()),
        };
        let object = ObjectKey::path_complete(&entry.study_id, &entry.s3_file_path);
        let bytes = match self.store.get(&object) {
            Ok(bytes) => bytes,
            Err(err) if is_permanent(&err) => return Prepared::Skip(format!("{err:#}")),
            Err(err) => return Prepared::Retry(err),
        };
        if !parsed.data_type.is_chunkable() {
            return Prepared::Unchunked { parsed, bytes };
        }
        if parsed.extension != "csv" {
            return Prepared::Skip(format!(
                "{} payload for chunkable stream {}",
                parsed.extension, parsed.data_type
            ));
        }
        let body = match TabularBody::parse(&bytes) {
            Ok(body) => body,
            Err(err) => return Prepared::Skip(err.to_string()),
        };

        let quantum = self.config.quantum_secs;
        let key_for = |time_bin: TimeBin| ChunkKey {
            study_id: parsed.study_id.clone(),
            participant_id: parsed.participant_id.clone(),
            data_type: parsed.data_type,
            survey_id: parsed.survey_id.clone(),
            time_bin,
        };
        if parsed.data_type == DataType::Identifiers {
            let Some(secs) = parsed.timestamp_secs() else {
                return Prepared::Skip("identifiers file has no timestamp".into());
            };
            return match TimeBin::containing(secs, quantum) {
                Ok(time_bin) => Prepared::Bucketed {
                    contributions: vec![Contribution {
                        key: key_for(time_bin),
                        header: body.header().to_string(),
                        rows: body.rows().to_vec(),
                    }],
                    dropped: 0,
                },
                Err(err) => Prepared::Skip(err.to_string()),
            };
        }

        let binned = match body.bin_rows(quantum) {
            Ok(binned) => binned,
            Err(err) => return Prepared::Skip(err.to_string()),
        };
        if binned.dropped > 0 {
            warn!(path = %entry.s3_file_path, dropped = binned.dropped, "rows without a timecode dropped");
        }
        Prepared::Bucketed {
            contributions: binned
                .bins
                .into_iter()
                .map(|(time_bin, rows)| Contribution {
                    key: key_for(time_bin),
                    header: body.header().to_string(),
                    rows,
                })
                .collect(),
            dropped: binned.dropped,
        }
    }

    fn merge_bucket(&self, key: &ChunkKey, header: &str, rows: &[String]) -> Result<MergeOutcome> {
        let existing = self.registry.find_live(key)?;
        let chunk_path = match &existing {
            Some(record) => record.chunk_path.clone(),
            None => key.chunk_path()?,
        };
        let current = match &existing {
            Some(record) => match self.store.get(&ObjectKey::path_complete(&key.study_id, &record.blob_key)) {
                Ok(bytes) => Some(
                    TabularBody::parse(&bytes)
                        .with_context(|| format!("stored chunk {} is unreadable", record.blob_key))?,
                ),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };
        let base = current.unwrap_or_else(|| TabularBody::new(header, Vec::new()));
        let merged = base.merge(rows);
        let content = normalize_trailing_newline(&merged.body.to_bytes());
        let digest = chunk_hash(&content);
        if existing
            .as_ref()
            .is_some_and(|record| record.chunk_hash.as_deref() == Some(digest.as_str()))
        {
            return Ok(MergeOutcome::Unchanged);
        }

        let blob_key = versioned_blob_key(&chunk_path, &digest);
        let previous = existing
            .as_ref()
            .map(|record| record.blob_key.as_str())
            .filter(|previous| *previous != blob_key);
        let object = ObjectKey::path_complete(&key.study_id, &blob_key);
        self.store.put(&object, &content)?;
        let switched = self.index.with_immediate_tx(|tx| {
            let record = register_chunked_tx(tx, key, &chunk_path, &blob_key, &content)?;
            add_observations_tx(
                tx,
                &key.participant_id,
                key.data_type,
                key.time_bin.start(),
                merged.added,
            )?;
            Ok(record)
        });
        let record = match switched {
            Ok(record) => record,
            Err(err) => {
                if existing.is_none() || previous.is_some() {
                    self.discard(&object);
                }
                return Err(err);
            }
        };
        if let Some(previous) = previous {
            self.discard(&ObjectKey::path_complete(&key.study_id, previous));
        }
        debug!(
            %chunk_path,
            %blob_key,
            added = merged.added,
            observations = record.number_of_observations,
            "chunk merged"
        );
        Ok(if existing.is_some() {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Created
        })
    }

    /// Delete a blob no registry row names.
    fn discard(&self, object: &ObjectKey) {
        if let Err(err) = self.store.delete(object) {
            warn!(key = object.as_str(), error = %format!("{err:#}"), "failed to delete unreferenced chunk blob");
        }
    }

    fn store_unchunked(&self, entry: &BacklogEntry, parsed: &ParsedPath, bytes: &[u8]) -> Result<()> {
        let chunk_path = unchunked_chunk_path(&entry.s3_file_path);
        self.store.copy(
            &ObjectKey::path_complete(&entry.study_id, &entry.s3_file_path),
            &ObjectKey::path_complete(&entry.study_id, &chunk_path),
        )?;
        let secs = parsed.timestamp_secs().unwrap_or(entry.created_at);
        let time_bin = TimeBin::containing(secs, self.config.quantum_secs)?;
        let record = self.index.with_immediate_tx(|tx| {
            let record = register_unchunked_tx(tx, parsed, time_bin, &chunk_path, bytes)?;
            add_observations_tx(
                tx,
                &parsed.participant_id,
                parsed.data_type,
                secs,
                record.number_of_observations,
            )?;
            Ok(record)
        })?;
        debug!(%chunk_path, observations = record.number_of_observations, "unchunked file stored");
        Ok(())
    }

    /// Recompute digests and observation counts of bucketed chunks from
    /// their stored content, fixing rows that disagree.
    ///
    /// # Errors
    /// Fails on index errors or store failures other than missing blobs.
    pub fn recount(&self, query: &ChunkQuery) -> Result<RecountSummary> {
        let mut summary = RecountSummary::default();
        for record in self.registry.query(query)? {
            if !record.is_chunkable {
                continue;
            }
            summary.checked += 1;
            let object = ObjectKey::path_complete(&record.study_id, &record.blob_key);
            let content = match self.store.get(&object) {
                Ok(content) => content,
                Err(err) if is_not_found(&err) => {
                    warn!(chunk_path = %record.chunk_path, blob_key = %record.blob_key, "chunk blob missing");
                    summary.missing += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut hasher = ChunkHasher::new();
            for piece in content.chunks(RECOUNT_PIECE) {
                hasher.update(piece);
            }
            let (hash, observations) = hasher.finish();
            if record.chunk_hash.as_deref() != Some(hash.as_str()) || record.number_of_observations != observations {
                self.registry.update_counts(record.id, &hash, observations)?;
                summary.updated += 1;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::chunks::ChunkRecord;
    use crate::config::StoreConfig;
    use crate::lock::LockError;
    use crate::stats::Statistics;
    use crate::store::{testing::StaticKeys, MemoryBackend, Operation};
    use tempfile::{tempdir, TempDir};

    const HOUR: i64 = 1_609_459_200;

    struct Fixture {
        _temp: TempDir,
        index: Index,
        backend: Arc<MemoryBackend>,
        store: ObjectStore,
        chunker: Chunker,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let temp = tempdir()?;
            let index = Index::open(temp.path())?;
            let backend = Arc::new(MemoryBackend::new());
            let store = ObjectStore::new(
                backend.clone(),
                Arc::new(StaticKeys::with(&["s1"])),
                &StoreConfig {
                    retries: 0,
                    retry_delay: Duration::ZERO,
                    list_page_size: 100,
                },
            );
            let chunker = Chunker::new(
                &index,
                store.clone(),
                ChunkingConfig {
                    concurrency: 4,
                    page_size: 2,
                    quantum_secs: 3600,
                },
            );
            Ok(Self {
                _temp: temp,
                index,
                backend,
                store,
                chunker,
            })
        }

        fn upload(&self, path: &str, content: &str) -> Result<()> {
            self.store
                .put(&ObjectKey::path_complete("s1", path), content.as_bytes())?;
            Backlog::new(self.index.clone()).enqueue(path, "s1", "p1")?;
            Ok(())
        }

        fn registry(&self) -> ChunkRegistry {
            ChunkRegistry::new(self.index.clone())
        }

        fn backlog_len(&self) -> Result<u64> {
            Backlog::new(self.index.clone()).len()
        }

        fn chunk_blobs(&self) -> Result<Vec<String>> {
            self.store
                .list(&ObjectKey::path_complete("s1", "CHUNKED_DATA/s1/p1/gps/"))
        }

        fn hourly_gps_observations(&self) -> Result<u64> {
            Ok(Statistics::new(self.index.clone())
                .hourly("p1", Some(DataType::Gps), None, None)?
                .iter()
                .map(|stat| stat.number_of_observations)
                .sum())
        }

        /// Content stored under the row's blob and the digest of that content.
        fn live_content(&self, record: &ChunkRecord) -> Result<(Vec<u8>, String)> {
            let content = self
                .store
                .get(&ObjectKey::path_complete("s1", &record.blob_key))?;
            let digest = chunk_hash(&content);
            Ok((content, digest))
        }
    }

    fn gps_file(start: i64, rows: usize) -> String {
        let mut out = String::from("timestamp,UTC time,latitude,longitude\n");
        for idx in 0..rows {
            let secs = start + i64::try_from(idx).unwrap();
            out.push_str(&format!("{secs}000,t,{idx}.0,1.0\n"));
        }
        out
    }

    fn gps_key(start: i64) -> ChunkKey {
        ChunkKey {
            study_id: "s1".into(),
            participant_id: "p1".into(),
            data_type: DataType::Gps,
            survey_id: None,
            time_bin: TimeBin::from_start(start),
        }
    }

    #[test]
    fn hundred_observations_land_in_one_bucket() -> Result<()> {
        let fixture = Fixture::new()?;
        let event = HOUR + 125;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459325000.csv", &gps_file(event, 100))?;

        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_processed, 1);
        assert_eq!(summary.chunks_created, 1);
        assert_eq!(fixture.backlog_len()?, 0);

        let bucket = event.div_euclid(3600) * 3600;
        let chunk = fixture.registry().find_live(&gps_key(bucket))?.unwrap();
        assert_eq!(chunk.number_of_observations, 100);
        assert_eq!(chunk.chunk_path, "CHUNKED_DATA/s1/p1/gps/2021-01-01T00:00:00.csv");
        let digest = chunk.chunk_hash.clone().unwrap();
        assert_eq!(chunk.blob_key, versioned_blob_key(&chunk.chunk_path, &digest));
        assert_eq!(fixture.live_content(&chunk)?.1, digest);
        assert_eq!(fixture.chunk_blobs()?, vec![chunk.blob_key.clone()]);
        assert_eq!(fixture.hourly_gps_observations()?, 100);
        Ok(())
    }

    #[test]
    fn reingesting_the_same_content_is_idempotent() -> Result<()> {
        let fixture = Fixture::new()?;
        let content = gps_file(HOUR, 10);
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &content)?;
        fixture.chunker.run_pass()?;
        let before = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();

        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &content)?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.chunks_unchanged, 1);
        assert_eq!(summary.chunks_created, 0);
        let after = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();
        assert_eq!(after.chunk_hash, before.chunk_hash);
        assert_eq!(after.number_of_observations, 10);
        assert_eq!(fixture.registry().query(&ChunkQuery::study("s1"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn rows_split_across_buckets_and_merge_in_order() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609462790000.csv", &gps_file(HOUR + 3590, 20))?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459300000.csv", &gps_file(HOUR + 100, 5))?;
        fixture.upload(
            "RAW_DATA/s1/p1/gps/1609459400000.csv",
            "timestamp,UTC time,latitude,longitude\nnot-a-time,t,0,0\n",
        )?;

        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_processed, 3);
        assert_eq!(summary.rows_dropped, 1);

        let first = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();
        let second = fixture.registry().find_live(&gps_key(HOUR + 3600))?.unwrap();
        assert_eq!(first.number_of_observations, 15);
        assert_eq!(second.number_of_observations, 10);

        let (stored, digest) = fixture.live_content(&first)?;
        assert_eq!(first.chunk_hash.as_deref(), Some(digest.as_str()));
        let body = TabularBody::parse(&stored)?;
        assert!(body.rows()[0].starts_with("1609459300000"));

        let hourly = Statistics::new(fixture.index.clone()).hourly("p1", Some(DataType::Gps), None, None)?;
        assert_eq!(
            hourly.iter().map(|stat| stat.number_of_observations).collect::<Vec<_>>(),
            vec![15, 10]
        );
        Ok(())
    }

    #[test]
    fn updates_switch_to_a_new_blob_and_drop_the_old_one() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 3))?;
        fixture.chunker.run_pass()?;
        let before = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();

        fixture.upload("RAW_DATA/s1/p1/gps/1609459300000.csv", &gps_file(HOUR + 100, 2))?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.chunks_updated, 1);

        let after = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.chunk_path, before.chunk_path);
        assert_ne!(after.blob_key, before.blob_key);
        assert_eq!(after.number_of_observations, 5);
        assert_eq!(fixture.chunk_blobs()?, vec![after.blob_key.clone()]);
        assert_eq!(fixture.hourly_gps_observations()?, 5);
        Ok(())
    }

    #[test]
    fn failed_registry_switch_leaves_row_and_blob_consistent() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 4))?;
        fixture.chunker.run_pass()?;
        let before = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();

        fixture.index.connection()?.execute_batch(
            "CREATE TRIGGER block_chunk_update BEFORE UPDATE ON chunks \
             BEGIN SELECT RAISE(ABORT, 'chunk updates blocked'); END;",
        )?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459210000.csv", &gps_file(HOUR + 10, 6))?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_retained, 1);
        assert_eq!(summary.chunks_updated, 0);
        assert_eq!(fixture.backlog_len()?, 1);

        let during = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();
        assert_eq!(during, before);
        let (content, digest) = fixture.live_content(&during)?;
        assert_eq!(during.chunk_hash.as_deref(), Some(digest.as_str()));
        assert_eq!(TabularBody::parse(&content)?.rows().len(), 4);
        assert_eq!(fixture.chunk_blobs()?, vec![during.blob_key.clone()]);
        assert_eq!(fixture.hourly_gps_observations()?, 4);

        fixture
            .index
            .connection()?
            .execute_batch("DROP TRIGGER block_chunk_update;")?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.chunks_updated, 1);
        assert_eq!(fixture.backlog_len()?, 0);

        let after = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();
        assert_eq!(after.number_of_observations, 10);
        let (_, digest) = fixture.live_content(&after)?;
        assert_eq!(after.chunk_hash.as_deref(), Some(digest.as_str()));
        assert_eq!(fixture.chunk_blobs()?, vec![after.blob_key.clone()]);
        assert_eq!(fixture.hourly_gps_observations()?, 10);
        Ok(())
    }

    #[test]
    fn failed_blob_write_keeps_the_entry_queued() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 2))?;
        fixture.chunker.run_pass()?;
        let before = fixture.registry().find_live(&gps_key(HOUR))?.unwrap();

        fixture.upload("RAW_DATA/s1/p1/gps/1609459260000.csv", &gps_file(HOUR + 60, 3))?;
        fixture.backend.fail_next(Operation::Put, 1);
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_retained, 1);
        assert_eq!(fixture.registry().find_live(&gps_key(HOUR))?.unwrap(), before);
        assert_eq!(fixture.hourly_gps_observations()?, 2);

        fixture.chunker.run_pass()?;
        assert_eq!(
            fixture.registry().find_live(&gps_key(HOUR))?.unwrap().number_of_observations,
            5
        );
        assert_eq!(fixture.hourly_gps_observations()?, 5);
        Ok(())
    }

    #[test]
    fn held_lock_aborts_the_pass() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 1))?;
        let lock = ProcessingLock::new(fixture.index.clone());
        lock.lock()?;
        let err = fixture.chunker.run_pass().unwrap_err();
        assert!(err.downcast_ref::<LockError>().is_some());
        assert_eq!(fixture.backlog_len()?, 1);
        assert!(lock.is_locked()?);
        Ok(())
    }

    #[test]
    fn permanent_and_transient_failures_are_told_apart() -> Result<()> {
        let fixture = Fixture::new()?;
        let backlog = Backlog::new(fixture.index.clone());
        backlog.enqueue("RAW_DATA/s1/p1/gps/1609459200000.csv", "s1", "p1")?;
        backlog.enqueue("RAW_DATA/s1/p1/unknownStream/1609459200000.csv", "s1", "p1")?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_skipped, 2);
        assert_eq!(fixture.backlog_len()?, 0);

        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 3))?;
        fixture.backend.fail_next(Operation::Get, 1);
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_retained, 1);
        assert_eq!(fixture.backlog_len()?, 1);

        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.entries_processed, 1);
        assert_eq!(fixture.backlog_len()?, 0);
        Ok(())
    }

    #[test]
    fn unchunkable_files_are_copied_and_registered() -> Result<()> {
        let fixture = Fixture::new()?;
        let raw = "RAW_DATA/s1/p1/surveyAnswers/sv1/1609459200000.csv";
        fixture.upload(raw, "question,answer\nq1,yes\n")?;
        let summary = fixture.chunker.run_pass()?;
        assert_eq!(summary.unchunked_registered, 1);

        let records = fixture.registry().query(&ChunkQuery::study("s1"))?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chunk_path, "CHUNKED_DATA/s1/p1/surveyAnswers/sv1/1609459200000.csv");
        assert_eq!(records[0].time_bin, TimeBin::from_start(HOUR));
        assert!(fixture.backend.raw(raw).is_some());
        assert!(fixture.backend.raw(&records[0].chunk_path).is_some());
        assert_eq!(records[0].blob_key, records[0].chunk_path);
        let hourly = Statistics::new(fixture.index.clone()).hourly("p1", Some(DataType::SurveyAnswers), None, None)?;
        assert_eq!(hourly[0].number_of_observations, 1);
        Ok(())
    }

    #[test]
    fn identifiers_bin_by_file_timestamp() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload(
            "RAW_DATA/s1/p1/identifiers_1609459500.csv",
            "patient_id,device_id\np1,dev\n",
        )?;
        fixture.chunker.run_pass()?;
        let mut key = gps_key(HOUR);
        key.data_type = DataType::Identifiers;
        let chunk = fixture.registry().find_live(&key)?.unwrap();
        assert_eq!(chunk.number_of_observations, 1);
        Ok(())
    }

    #[test]
    fn recount_repairs_drifted_rows() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.upload("RAW_DATA/s1/p1/gps/1609459200000.csv", &gps_file(HOUR, 7))?;
        fixture.chunker.run_pass()?;
        let registry = fixture.registry();
        let chunk = registry.find_live(&gps_key(HOUR))?.unwrap();
        registry.update_counts(chunk.id, "stale", 1)?;

        let summary = fixture.chunker.recount(&ChunkQuery::study("s1"))?;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.updated, 1);
        let repaired = registry.find_live(&gps_key(HOUR))?.unwrap();
        assert_eq!(repaired.number_of_observations, 7);
        assert_eq!(repaired.chunk_hash, chunk.chunk_hash);

        let again = fixture.chunker.recount(&ChunkQuery::study("s1"))?;
        assert_eq!(again.updated, 0);
        Ok(())
    }
}
