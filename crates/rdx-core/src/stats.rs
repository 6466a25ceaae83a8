//! Reception statistics: running totals and hourly buckets per participant
//! and data type.
//!
//! Every increment is a single upsert keyed on its own row, so concurrent
//! writers for different keys never wait on each other beyond sqlite's
//! write lock.

use anyhow::Result;
use rdx_domain::{parse_file, truncate_to_hour, DataType};
use rusqlite::{params, params_from_iter, types::Type, types::Value, Row, Transaction};
use serde::Serialize;
use tracing::{debug, warn};

use crate::index::{now_secs, Index};

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadStat {
    pub participant_id: String,
    pub data_type: DataType,
    pub number_of_uploads: u64,
    pub number_bytes_uploaded: u64,
    pub last_upload_timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HourlyStat {
    pub participant_id: String,
    pub data_type: DataType,
    pub hour: i64,
    pub number_of_uploads: u64,
    pub number_bytes_uploaded: u64,
    pub number_of_observations: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeeklyUsage {
    pub data_type: DataType,
    pub uploads: u64,
    pub megabytes: f64,
}

fn data_type_column(row: &Row<'_>, name: &str) -> rusqlite::Result<DataType> {
    let text: String = row.get(name)?;
    DataType::try_from(text.as_str())
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err)))
}

fn count_column(row: &Row<'_>, name: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(name)?;
    Ok(u64::try_from(value).unwrap_or(0))
}

fn size_param(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

impl UploadStat {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            participant_id: row.get("participant_id")?,
            data_type: data_type_column(row, "data_type")?,
            number_of_uploads: count_column(row, "number_of_uploads")?,
            number_bytes_uploaded: count_column(row, "number_bytes_uploaded")?,
            last_upload_timestamp: row.get("last_upload_timestamp")?,
        })
    }
}

impl HourlyStat {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            participant_id: row.get("participant_id")?,
            data_type: data_type_column(row, "data_type")?,
            hour: row.get("hour")?,
            number_of_uploads: count_column(row, "number_of_uploads")?,
            number_bytes_uploaded: count_column(row, "number_bytes_uploaded")?,
            number_of_observations: count_column(row, "number_of_observations")?,
        })
    }
}

/// Data type named by a stored upload path, or `None` when the path does
/// not parse.
fn data_type_of(file_path: &str) -> Option<DataType> {
    match parse_file(file_path) {
        Ok(parsed) => Some(parsed.data_type),
        Err(err) => {
            warn!(file_path, error = %err, "cannot derive data type for statistics");
            None
        }
    }
}

fn bump_counters(
    tx: &Transaction<'_>,
    participant_id: &str,
    data_type: DataType,
    size: u64,
    timestamp: i64,
) -> Result<()> {
    tx.execute(
        "INSERT INTO received_data_stats \
         (participant_id, data_type, number_of_uploads, number_bytes_uploaded, last_upload_timestamp) \
         VALUES (?1, ?2, 1, ?3, ?4) \
         ON CONFLICT(participant_id, data_type) DO UPDATE SET \
         number_of_uploads = number_of_uploads + 1, \
         number_bytes_uploaded = number_bytes_uploaded + excluded.number_bytes_uploaded, \
         last_upload_timestamp = MAX(last_upload_timestamp, excluded.last_upload_timestamp)",
        params![participant_id, data_type.as_str(), size_param(size), timestamp],
    )?;
    tx.execute(
        "INSERT INTO received_data_stats_hourly \
         (participant_id, data_type, hour, number_of_uploads, number_bytes_uploaded) \
         VALUES (?1, ?2, ?3, 1, ?4) \
         ON CONFLICT(participant_id, data_type, hour) DO UPDATE SET \
         number_of_uploads = number_of_uploads + 1, \
         number_bytes_uploaded = number_bytes_uploaded + excluded.number_bytes_uploaded",
        params![
            participant_id,
            data_type.as_str(),
            truncate_to_hour(timestamp),
            size_param(size)
        ],
    )?;
    Ok(())
}

/// Hourly observation increment inside the caller's transaction.
pub(crate) fn add_observations_tx(
    tx: &Transaction<'_>,
    participant_id: &str,
    data_type: DataType,
    timestamp: i64,
    observations: u64,
) -> Result<()> {
    if observations == 0 {
        return Ok(());
    }
    tx.execute(
        "INSERT INTO received_data_stats_hourly \
         (participant_id, data_type, hour, number_of_observations) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(participant_id, data_type, hour) DO UPDATE SET \
         number_of_observations = number_of_observations + excluded.number_of_observations",
        params![
            participant_id,
            data_type.as_str(),
            truncate_to_hour(timestamp),
            size_param(observations)
        ],
    )?;
    Ok(())
}

/// Track one stored upload and fold it into the counters, inside the
/// caller's transaction.
pub(crate) fn record_upload_tx(
    tx: &Transaction<'_>,
    file_path: &str,
    participant_id: &str,
    size: u64,
    timestamp: i64,
) -> Result<Option<DataType>> {
    let data_type = data_type_of(file_path);
    tx.execute(
        "INSERT INTO upload_tracking(file_path, file_size, timestamp, participant_id, data_type) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            file_path,
            size_param(size),
            timestamp,
            participant_id,
            data_type.map(DataType::as_str)
        ],
    )?;
    if let Some(data_type) = data_type {
        bump_counters(tx, participant_id, data_type, size, timestamp)?;
    }
    Ok(data_type)
}

#[derive(Clone, Debug)]
pub struct Statistics {
    index: Index,
}

impl Statistics {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    /// Count one upload of `size` bytes at `timestamp`. Returns the data
    /// type it was counted under; unparseable paths are skipped.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn update_statistics(
        &self,
        file_path: &str,
        participant_id: &str,
        size: u64,
        timestamp: i64,
    ) -> Result<Option<DataType>> {
        let Some(data_type) = data_type_of(file_path) else {
            return Ok(None);
        };
        self.index
            .with_immediate_tx(|tx| bump_counters(tx, participant_id, data_type, size, timestamp))?;
        Ok(Some(data_type))
    }

    /// Add observations to the hourly bucket containing `timestamp`.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn add_observations(
        &self,
        participant_id: &str,
        data_type: DataType,
        timestamp: i64,
        observations: u64,
    ) -> Result<()> {
        if observations == 0 {
            return Ok(());
        }
        self.index
            .with_immediate_tx(|tx| add_observations_tx(tx, participant_id, data_type, timestamp, observations))
    }

    /// Running totals, optionally for one participant.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn running(&self, participant_id: Option<&str>) -> Result<Vec<UploadStat>> {
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(
            "SELECT participant_id, data_type, number_of_uploads, number_bytes_uploaded, last_upload_timestamp \
             FROM received_data_stats WHERE (?1 IS NULL OR participant_id = ?1) \
             ORDER BY participant_id, data_type",
        )?;
        let stats = stmt
            .query_map(params![participant_id], UploadStat::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Hourly buckets for a participant, optionally narrowed to one data
    /// type and an inclusive hour range.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn hourly(
        &self,
        participant_id: &str,
        data_type: Option<DataType>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<HourlyStat>> {
        let mut sql = String::from(
            "SELECT participant_id, data_type, hour, number_of_uploads, number_bytes_uploaded, \
             number_of_observations FROM received_data_stats_hourly WHERE participant_id = ?1",
        );
        let mut values = vec![Value::Text(participant_id.to_string())];
        if let Some(data_type) = data_type {
            values.push(Value::Text(data_type.as_str().to_string()));
            sql.push_str(&format!(" AND data_type = ?{}", values.len()));
        }
        if let Some(start) = start {
            values.push(Value::Integer(start));
            sql.push_str(&format!(" AND hour >= ?{}", values.len()));
        }
        if let Some(end) = end {
            values.push(Value::Integer(end));
            sql.push_str(&format!(" AND hour <= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY hour, data_type");
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let stats = stmt
            .query_map(params_from_iter(values), HourlyStat::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Recompute running totals from the upload tracking log. Returns the
    /// number of counter rows written.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn rebuild(&self) -> Result<usize> {
        let rows = self.index.with_immediate_tx(|tx| {
            tx.execute("DELETE FROM received_data_stats", [])?;
            Ok(tx.execute(
                "INSERT INTO received_data_stats \
                 (participant_id, data_type, number_of_uploads, number_bytes_uploaded, last_upload_timestamp) \
                 SELECT participant_id, data_type, COUNT(*), SUM(file_size), MAX(timestamp) \
                 FROM upload_tracking WHERE data_type IS NOT NULL \
                 GROUP BY participant_id, data_type",
                [],
            )?)
        })?;
        debug!(rows, "running statistics rebuilt");
        Ok(rows)
    }

    /// Drop every counter for a participant. Returns rows removed.
    ///
    /// # Errors
    /// Fails when the index cannot be written.
    pub fn purge(&self, participant_id: &str) -> Result<usize> {
        let removed = self.index.with_immediate_tx(|tx| {
            let running = tx.execute(
                "DELETE FROM received_data_stats WHERE participant_id = ?1",
                params![participant_id],
            )?;
            let hourly = tx.execute(
                "DELETE FROM received_data_stats_hourly WHERE participant_id = ?1",
                params![participant_id],
            )?;
            Ok(running + hourly)
        })?;
        debug!(participant_id, removed, "statistics purged");
        Ok(removed)
    }

    /// Uploads and megabytes per data type over the trailing `days`.
    ///
    /// # Errors
    /// Fails when the index cannot be read.
    pub fn weekly(&self, days: i64) -> Result<Vec<WeeklyUsage>> {
        self.usage_since(now_secs() - days.max(0) * 86_400)
    }

    fn usage_since(&self, since: i64) -> Result<Vec<WeeklyUsage>> {
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(
            "SELECT data_type, COUNT(*) AS uploads, SUM(file_size) AS bytes FROM upload_tracking \
             WHERE timestamp >= ?1 AND data_type IS NOT NULL GROUP BY data_type ORDER BY data_type",
        )?;
        let usage = stmt
            .query_map(params![since], |row| {
                #[allow(clippy::cast_precision_loss)]
                let megabytes = count_column(row, "bytes")? as f64 / BYTES_PER_MEGABYTE;
                Ok(WeeklyUsage {
                    data_type: data_type_column(row, "data_type")?,
                    uploads: count_column(row, "uploads")?,
                    megabytes,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GPS: &str = "RAW_DATA/s1/p1/gps/1609459200000.csv";
    const ACCEL: &str = "RAW_DATA/s1/p1/accel/1609459200000.csv";

    #[test]
    fn running_totals_ignore_interleaving() -> Result<()> {
        let temp = tempdir()?;
        let stats = Statistics::new(Index::open(temp.path())?);
        stats.update_statistics(GPS, "p1", 10, 1_609_459_200)?;
        stats.update_statistics(ACCEL, "p1", 99, 1_609_459_300)?;
        stats.update_statistics(GPS, "p1", 20, 1_609_462_900)?;
        stats.update_statistics(ACCEL, "p1", 1, 1_609_459_100)?;
        stats.update_statistics(GPS, "p1", 30, 1_609_459_000)?;

        let running = stats.running(Some("p1"))?;
        let gps = running.iter().find(|stat| stat.data_type == DataType::Gps).unwrap();
        assert_eq!(gps.number_of_uploads, 3);
        assert_eq!(gps.number_bytes_uploaded, 60);
        assert_eq!(gps.last_upload_timestamp, 1_609_462_900);
        let accel = running
            .iter()
            .find(|stat| stat.data_type == DataType::Accelerometer)
            .unwrap();
        assert_eq!(accel.number_of_uploads, 2);
        assert_eq!(accel.last_upload_timestamp, 1_609_459_300);
        Ok(())
    }

    #[test]
    fn hourly_buckets_are_additive() -> Result<()> {
        let temp = tempdir()?;
        let stats = Statistics::new(Index::open(temp.path())?);
        stats.update_statistics(GPS, "p1", 10, 1_609_459_200)?;
        stats.update_statistics(GPS, "p1", 5, 1_609_459_999)?;
        stats.update_statistics(GPS, "p1", 7, 1_609_462_800)?;
        stats.add_observations("p1", DataType::Gps, 1_609_459_500, 40)?;
        stats.add_observations("p1", DataType::Gps, 1_609_459_600, 2)?;

        let hourly = stats.hourly("p1", Some(DataType::Gps), None, None)?;
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].hour, 1_609_459_200);
        assert_eq!(hourly[0].number_of_uploads, 2);
        assert_eq!(hourly[0].number_bytes_uploaded, 15);
        assert_eq!(hourly[0].number_of_observations, 42);
        assert_eq!(stats.hourly("p1", None, Some(1_609_462_800), None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn unparseable_paths_are_not_counted() -> Result<()> {
        let temp = tempdir()?;
        let stats = Statistics::new(Index::open(temp.path())?);
        assert_eq!(stats.update_statistics("RAW_DATA/s1/p1/nope/1.csv", "p1", 1, 0)?, None);
        assert!(stats.running(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn rebuild_purge_and_weekly_use_the_tracking_log() -> Result<()> {
        let temp = tempdir()?;
        let index = Index::open(temp.path())?;
        let stats = Statistics::new(index.clone());
        let now = now_secs();
        index.with_immediate_tx(|tx| {
            record_upload_tx(tx, GPS, "p1", 1024 * 1024, now)?;
            record_upload_tx(tx, GPS, "p1", 1024 * 1024, now - 60)?;
            record_upload_tx(tx, ACCEL, "p2", 10, now - 30 * 86_400)?;
            record_upload_tx(tx, "garbage", "p2", 10, now)?;
            Ok(())
        })?;
        index
            .connection()?
            .execute("UPDATE received_data_stats SET number_of_uploads = 99", [])?;

        assert_eq!(stats.rebuild()?, 2);
        let running = stats.running(Some("p1"))?;
        assert_eq!(running[0].number_of_uploads, 2);
        assert_eq!(running[0].last_upload_timestamp, now);

        let weekly = stats.weekly(7)?;
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].data_type, DataType::Gps);
        assert_eq!(weekly[0].uploads, 2);
        assert!((weekly[0].megabytes - 2.0).abs() < f64::EPSILON);

        assert!(stats.purge("p1")? >= 2);
        assert!(stats.running(Some("p1"))?.is_empty());
        assert_eq!(stats.running(None)?.len(), 1);
        Ok(())
    }
}
