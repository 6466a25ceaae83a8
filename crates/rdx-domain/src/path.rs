//! Storage path grammar.
//!
//! Three layouts are in circulation: chunk paths under `CHUNKED_DATA/`, raw
//! uploads under `RAW_DATA/`, and an older raw layout without the folder
//! marker whose fields all sit one segment earlier. [`Layout::detect`] picks
//! the layout from the leading segment; the field positions then come from
//! the layout alone.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::data_type::{is_allowed_extension, DataType, DataTypeError};
use crate::time_bin::{parse_api_time, timecode_secs, TimeBin, TimeError};

pub const RAW_DATA_FOLDER: &str = "RAW_DATA";
pub const CHUNKS_FOLDER: &str = "CHUNKED_DATA";
pub const KEYS_FOLDER: &str = "KEYS";
pub const CHUNK_EXTENSION: &str = "csv";

const STUDY_INDEX: usize = 1;
const PARTICIPANT_INDEX: usize = 2;
const DATA_TYPE_INDEX: usize = 3;
const SURVEY_INDEX: usize = 4;
const IMAGE_INSTANCE_INDEX: usize = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("[RD203] path is empty")]
    Empty,
    #[error("[RD204] extension '{0}' is not accepted")]
    UnsupportedExtension(String),
    #[error("[RD205] path '{path}' has {found} segments, expected at least {needed}")]
    MissingSegments {
        path: String,
        needed: usize,
        found: usize,
    },
    #[error(transparent)]
    DataType(#[from] DataTypeError),
}

impl PathError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "RD203",
            Self::UnsupportedExtension(_) => "RD204",
            Self::MissingSegments { .. } => "RD205",
            Self::DataType(DataTypeError::UnknownName(_)) => "RD201",
            Self::DataType(DataTypeError::UnknownSegment(_)) => "RD202",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Chunked,
    Raw,
    LegacyRaw,
}

impl Layout {
    #[must_use]
    pub fn detect(segments: &[&str]) -> Self {
        match segments.first().copied() {
            Some(CHUNKS_FOLDER) => Self::Chunked,
            Some(RAW_DATA_FOLDER) => Self::Raw,
            _ => Self::LegacyRaw,
        }
    }

    fn index(self, field: usize) -> usize {
        match self {
            Self::Chunked | Self::Raw => field,
            Self::LegacyRaw => field - 1,
        }
    }

    /// Data-type segment to [`DataType`].
    fn resolve_data_type(self, segment: &str) -> Result<DataType, DataTypeError> {
        if segment.contains(DataType::Identifiers.as_str()) {
            return Ok(DataType::Identifiers);
        }
        match self {
            // chunk paths use canonical names; unchunked copies keep the device segment
            Self::Chunked => DataType::try_from(segment)
                .or_else(|_| DataType::from_upload_segment(segment)),
            Self::Raw | Self::LegacyRaw if segment.contains("ios") => Ok(DataType::IosLog),
            Self::Raw | Self::LegacyRaw => DataType::from_upload_segment(segment),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Chunk,
    Raw,
}

/// Fields recovered from a data file path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParsedPath {
    pub path: String,
    pub layout: Layout,
    pub kind: FileKind,
    pub extension: String,
    pub study_id: String,
    pub participant_id: String,
    pub data_type: DataType,
    pub survey_id: Option<String>,
    pub image_instance: Option<String>,
    /// Time text as it appears in the path (timecode or ISO hour).
    pub time_segment: String,
}

impl ParsedPath {
    /// Unix seconds named by the time segment, when it has a known form.
    #[must_use]
    pub fn timestamp_secs(&self) -> Option<i64> {
        timecode_secs(&self.time_segment).or_else(|| parse_api_time(&self.time_segment).ok())
    }
}

/// Outcome of [`parse`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum PathRecord {
    /// Extensionless objects mark device registrations and carry no fields.
    RegistrationMarker { path: String },
    File(ParsedPath),
}

/// Parse a storage path into its fields.
///
/// # Errors
///
/// Returns a [`PathError`] for unsupported extensions, short paths, or
/// unknown data-type segments.
pub fn parse(path: &str) -> Result<PathRecord, PathError> {
    let path = path.trim_end();
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('/').collect();
    let file_name = segments.last().copied().unwrap_or_default();
    let Some((stem, extension)) = split_extension(file_name) else {
        return Ok(PathRecord::RegistrationMarker {
            path: path.to_string(),
        });
    };
    if !is_allowed_extension(extension) {
        return Err(PathError::UnsupportedExtension(extension.to_string()));
    }

    let layout = Layout::detect(&segments);
    let needed = layout.index(DATA_TYPE_INDEX) + 1;
    if segments.len() < needed {
        return Err(PathError::MissingSegments {
            path: path.to_string(),
            needed,
            found: segments.len(),
        });
    }
    let at = |field: usize| segments[layout.index(field)];
    let data_type_segment = at(DATA_TYPE_INDEX);
    let data_type = layout.resolve_data_type(data_type_segment)?;
    let file_index = segments.len() - 1;

    let time_source = if data_type == DataType::Identifiers && data_type_segment.contains('_') {
        data_type_segment
    } else {
        stem
    };
    let dotted = format!(".{extension}");
    let tail = time_source.rsplit('_').next().unwrap_or(time_source);
    let time_segment = tail.strip_suffix(dotted.as_str()).unwrap_or(tail).to_string();

    let mut survey_id = None;
    let mut image_instance = None;
    if data_type.carries_survey() {
        let survey_index = layout.index(SURVEY_INDEX);
        if survey_index < file_index {
            survey_id = Some(segments[survey_index].to_string());
        } else {
            debug!(path, "no survey id in path");
        }
        if data_type == DataType::ImageSurvey {
            let instance_index = layout.index(IMAGE_INSTANCE_INDEX);
            if instance_index < file_index {
                image_instance = Some(segments[instance_index].to_string());
            }
        }
    }

    Ok(PathRecord::File(ParsedPath {
        path: path.to_string(),
        layout,
        kind: match layout {
            Layout::Chunked => FileKind::Chunk,
            Layout::Raw | Layout::LegacyRaw => FileKind::Raw,
        },
        extension: extension.to_string(),
        study_id: at(STUDY_INDEX).to_string(),
        participant_id: at(PARTICIPANT_INDEX).to_string(),
        data_type,
        survey_id,
        image_instance,
        time_segment,
    }))
}

/// Parse a path that must name a data file.
///
/// # Errors
///
/// As [`parse`]; registration markers are reported as a missing extension.
pub fn parse_file(path: &str) -> Result<ParsedPath, PathError> {
    match parse(path)? {
        PathRecord::File(parsed) => Ok(parsed),
        PathRecord::RegistrationMarker { .. } => Err(PathError::UnsupportedExtension(String::new())),
    }
}

/// Survey id named by a path, if any.
#[must_use]
pub fn survey_id_of(path: &str) -> Option<String> {
    parse_file(path).ok().and_then(|parsed| parsed.survey_id)
}

fn split_extension(file_name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some((stem, ext))
}

/// Device file names are `<patient>_<segment>_..._<timecode>.<ext>`; older
/// clients omit the patient prefix.
#[must_use]
pub fn qualify_device_file_name(patient_id: &str, file_name: &str) -> String {
    let prefix = format!("{patient_id}_");
    if file_name.starts_with(&prefix) {
        file_name.to_string()
    } else {
        format!("{prefix}{file_name}")
    }
}

/// `RAW_DATA/<study>/<device file name with '_' as '/'>`.
#[must_use]
pub fn raw_path(study_id: &str, device_file_name: &str) -> String {
    format!(
        "{RAW_DATA_FOLDER}/{study_id}/{}",
        device_file_name.replace('_', "/")
    )
}

/// Where a device registration's identifiers file is written. The
/// timestamp rides on the data-type segment.
#[must_use]
pub fn identifiers_raw_path(study_id: &str, participant_id: &str, unix_secs: i64) -> String {
    format!("{RAW_DATA_FOLDER}/{study_id}/{participant_id}/identifiers_{unix_secs}.{CHUNK_EXTENSION}")
}

/// Canonical chunk location for one bucket.
///
/// # Errors
///
/// Fails when the bucket cannot be formatted as a date.
pub fn chunk_path(
    study_id: &str,
    participant_id: &str,
    data_type: DataType,
    survey_id: Option<&str>,
    bin: TimeBin,
) -> Result<String, TimeError> {
    let label = bin.label()?;
    Ok(match survey_id {
        Some(survey) => format!(
            "{CHUNKS_FOLDER}/{study_id}/{participant_id}/{data_type}/{survey}/{label}.{CHUNK_EXTENSION}"
        ),
        None => format!(
            "{CHUNKS_FOLDER}/{study_id}/{participant_id}/{data_type}/{label}.{CHUNK_EXTENSION}"
        ),
    })
}

/// Location of an unchunkable file once registered: the raw path moved
/// under the chunk folder.
#[must_use]
pub fn unchunked_chunk_path(raw: &str) -> String {
    match raw.strip_prefix(RAW_DATA_FOLDER) {
        Some(rest) => format!("{CHUNKS_FOLDER}{rest}"),
        None => format!("{CHUNKS_FOLDER}/{raw}"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyHalf {
    Public,
    Private,
}

impl fmt::Display for KeyHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Private => "private",
        })
    }
}

/// `KEYS/<study>/<participant>_{public,private}`.
#[must_use]
pub fn key_path(study_id: &str, participant_id: &str, half: KeyHalf) -> String {
    format!("{KEYS_FOLDER}/{study_id}/{participant_id}_{half}")
}
