use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};

/// Width of a chunk bucket in seconds.
pub const DEFAULT_QUANTUM_SECS: i64 = 3600;

/// Device timecodes are unix milliseconds (sometimes seconds); the first ten
/// digits are always the seconds part.
const TIMECODE_SECONDS_DIGITS: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("[RD210] timestamp {0} is outside the representable range")]
    OutOfRange(i64),
    #[error("[RD211] '{0}' is not a YYYY-MM-DDTHH:MM:SS time")]
    BadFormat(String),
    #[error("[RD212] bucket quantum must be positive (got {0})")]
    BadQuantum(i64),
}

/// Start of a fixed-width bucket, in unix seconds (UTC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBin(i64);

impl TimeBin {
    /// Bucket containing `unix_secs`: `floor(unix_secs / quantum) * quantum`.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::BadQuantum`] for a non-positive quantum.
    pub fn containing(unix_secs: i64, quantum: i64) -> Result<Self, TimeError> {
        if quantum <= 0 {
            return Err(TimeError::BadQuantum(quantum));
        }
        Ok(Self(unix_secs.div_euclid(quantum) * quantum))
    }

    /// Wrap a value already known to be bucket aligned (read back from the index).
    #[must_use]
    pub fn from_start(start: i64) -> Self {
        Self(start)
    }

    #[must_use]
    pub fn start(self) -> i64 {
        self.0
    }

    /// ISO hour label used as the chunk file name.
    ///
    /// # Errors
    ///
    /// Fails when the bucket start cannot be represented as a date.
    pub fn label(self) -> Result<String, TimeError> {
        format_api_time(self.0)
    }
}

impl std::fmt::Display for TimeBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.label() {
            Ok(label) => f.write_str(&label),
            Err(_) => write!(f, "@{}", self.0),
        }
    }
}

/// Seconds encoded by a device timecode, if it is numeric.
#[must_use]
pub fn timecode_secs(code: &str) -> Option<i64> {
    let code = code.trim();
    let head = code.get(..TIMECODE_SECONDS_DIGITS).unwrap_or(code);
    if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    head.parse().ok()
}

/// Format unix seconds as `YYYY-MM-DDTHH:MM:SS` in UTC.
///
/// # Errors
///
/// Returns [`TimeError::OutOfRange`] for timestamps `time` cannot represent.
pub fn format_api_time(unix_secs: i64) -> Result<String, TimeError> {
    let moment =
        OffsetDateTime::from_unix_timestamp(unix_secs).map_err(|_| TimeError::OutOfRange(unix_secs))?;
    moment
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]"
        ))
        .map_err(|_| TimeError::OutOfRange(unix_secs))
}

/// Parse a naive `YYYY-MM-DDTHH:MM:SS` string and pin it to UTC.
///
/// # Errors
///
/// Returns [`TimeError::BadFormat`] when the text does not match.
pub fn parse_api_time(text: &str) -> Result<i64, TimeError> {
    let naive = PrimitiveDateTime::parse(
        text.trim(),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    )
    .map_err(|_| TimeError::BadFormat(text.to_string()))?;
    Ok(naive.assume_utc().unix_timestamp())
}

#[must_use]
pub fn truncate_to_hour(unix_secs: i64) -> i64 {
    unix_secs.div_euclid(3600) * 3600
}
