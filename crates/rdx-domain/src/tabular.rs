//! Typed views of upload payloads and chunk bodies.

use std::collections::{BTreeMap, HashSet};

use crate::data_type::DataType;
use crate::hash::chunk_hash;
use crate::time_bin::{timecode_secs, TimeBin, TimeError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TabularError {
    #[error("[RD220] tabular payload is not valid UTF-8")]
    NotUtf8,
    #[error("[RD221] tabular payload has no header line")]
    MissingHeader,
}

/// Decrypted payload, shaped by what its data type is known to contain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadBody {
    /// Header line plus one observation per row.
    Tabular(TabularBody),
    /// Audio or image bytes; one observation per file.
    Media { extension: String, bytes: Vec<u8> },
    /// Survey answer documents whose schema the pipeline does not know.
    Opaque(Vec<u8>),
}

impl UploadBody {
    /// Shape `bytes` according to the stream and file extension.
    ///
    /// # Errors
    ///
    /// Fails when a tabular stream is not UTF-8 or has no header.
    pub fn classify(data_type: DataType, extension: &str, bytes: Vec<u8>) -> Result<Self, TabularError> {
        if data_type.is_media() {
            return Ok(Self::Media {
                extension: extension.to_string(),
                bytes,
            });
        }
        if extension == "csv" {
            return TabularBody::parse(&bytes).map(Self::Tabular);
        }
        Ok(Self::Opaque(bytes))
    }

    #[must_use]
    pub fn observation_count(&self) -> u64 {
        match self {
            Self::Tabular(body) => body.rows.len() as u64,
            Self::Media { .. } | Self::Opaque(_) => 1,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Tabular(body) => body.to_bytes(),
            Self::Media { bytes, .. } | Self::Opaque(bytes) => bytes.clone(),
        }
    }
}

/// A CSV body with its header split off. Blank lines are not observations
/// and are dropped on parse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TabularBody {
    header: String,
    rows: Vec<String>,
}

impl TabularBody {
    /// # Errors
    ///
    /// Fails on invalid UTF-8 or an empty payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, TabularError> {
        let text = std::str::from_utf8(bytes).map_err(|_| TabularError::NotUtf8)?;
        let mut lines = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty());
        let header = lines.next().ok_or(TabularError::MissingHeader)?.to_string();
        let rows = lines.map(str::to_string).collect();
        Ok(Self { header, rows })
    }

    #[must_use]
    pub fn new(header: impl Into<String>, rows: Vec<String>) -> Self {
        Self {
            header: header.into(),
            rows,
        }
    }

    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    #[must_use]
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Normalized bytes: header and rows, each ending in exactly one newline.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(
            self.header.len() + 1 + self.rows.iter().map(|row| row.len() + 1).sum::<usize>(),
        );
        out.push_str(&self.header);
        out.push('\n');
        for row in &self.rows {
            out.push_str(row);
            out.push('\n');
        }
        out.into_bytes()
    }

    #[must_use]
    pub fn digest(&self) -> String {
        chunk_hash(&self.to_bytes())
    }

    /// Group rows into buckets by their leading timecode.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::BadQuantum`] for a non-positive quantum.
    pub fn bin_rows(&self, quantum: i64) -> Result<BinnedRows, TimeError> {
        let mut bins: BTreeMap<TimeBin, Vec<String>> = BTreeMap::new();
        let mut dropped = 0;
        for row in &self.rows {
            match row_timecode(row) {
                Some(secs) => bins
                    .entry(TimeBin::containing(secs, quantum)?)
                    .or_default()
                    .push(row.clone()),
                None => dropped += 1,
            }
        }
        Ok(BinnedRows { bins, dropped })
    }

    /// Fold `incoming` rows into this body.
    ///
    /// Rows already present are skipped, so merging the same rows twice is a
    /// no-op. The result is ordered by timecode; rows with equal timecodes
    /// keep their arrival order. The existing header is kept.
    #[must_use]
    pub fn merge(&self, incoming: &[String]) -> Merged {
        let mut seen: HashSet<&str> = self.rows.iter().map(String::as_str).collect();
        let mut rows = self.rows.clone();
        let mut added = 0;
        for row in incoming {
            if seen.insert(row.as_str()) {
                rows.push(row.clone());
                added += 1;
            }
        }
        rows.sort_by_key(|row| row_timecode(row).unwrap_or(i64::MAX));
        Merged {
            body: Self {
                header: self.header.clone(),
                rows,
            },
            added,
        }
    }
}

/// Rows grouped by bucket, plus how many had no usable timecode.
#[derive(Debug, Default)]
pub struct BinnedRows {
    pub bins: BTreeMap<TimeBin, Vec<String>>,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct Merged {
    pub body: TabularBody,
    pub added: u64,
}

/// Seconds named by the first column of a CSV row.
#[must_use]
pub fn row_timecode(row: &str) -> Option<i64> {
    let first = row.split(',').next()?;
    timecode_secs(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    #[test]
    fn parse_drops_blank_lines_and_crlf() {
        let body = TabularBody::parse(b"timestamp,x\r\n1609459200000,a\r\n\r\n1609459201000,b\n\n").unwrap();
        assert_eq!(body.header(), "timestamp,x");
        assert_eq!(body.rows(), rows(&["1609459200000,a", "1609459201000,b"]).as_slice());
        assert_eq!(body.to_bytes(), b"timestamp,x\n1609459200000,a\n1609459201000,b\n");
        assert_eq!(TabularBody::parse(b"\n\n"), Err(TabularError::MissingHeader));
    }

    #[test]
    fn bins_rows_by_hour_and_counts_unusable_rows() {
        let body = TabularBody::new(
            "timestamp,x",
            rows(&["1609459200000,a", "1609462861000,b", "garbage,c", "1609459300000,d"]),
        );
        let binned = body.bin_rows(3600).unwrap();
        assert_eq!(binned.dropped, 1);
        let starts: Vec<i64> = binned.bins.keys().map(|bin| bin.start()).collect();
        assert_eq!(starts, vec![1_609_459_200, 1_609_462_800]);
        assert_eq!(binned.bins.values().next().unwrap().len(), 2);
    }

    #[test]
    fn merge_appends_only_new_rows_in_time_order() {
        let existing = TabularBody::new("t,x", rows(&["1609459200000,a", "1609459400000,c"]));
        let merged = existing.merge(&rows(&["1609459300000,b", "1609459200000,a"]));
        assert_eq!(merged.added, 1);
        assert_eq!(
            merged.body.rows(),
            rows(&["1609459200000,a", "1609459300000,b", "1609459400000,c"]).as_slice()
        );

        let again = merged.body.merge(&rows(&["1609459300000,b"]));
        assert_eq!(again.added, 0);
        assert_eq!(again.body.digest(), merged.body.digest());
    }

    #[test]
    fn classify_picks_variant_by_stream() {
        let media = UploadBody::classify(DataType::AudioRecordings, "mp4", vec![0, 1, 2]).unwrap();
        assert!(matches!(media, UploadBody::Media { .. }));
        assert_eq!(media.observation_count(), 1);

        let answers = UploadBody::classify(DataType::SurveyAnswers, "json", b"{\"q\":1}".to_vec()).unwrap();
        assert_eq!(answers, UploadBody::Opaque(b"{\"q\":1}".to_vec()));

        let gps = UploadBody::classify(DataType::Gps, "csv", b"t,lat\n1609459200000,1.0\n".to_vec()).unwrap();
        assert_eq!(gps.observation_count(), 1);
    }
}
