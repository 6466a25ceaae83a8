use serde::{Deserialize, Serialize};

/// Extensions a device upload may carry.
pub const ALLOWED_EXTENSIONS: &[&str] = &["csv", "json", "mp4", "wav", "txt", "jpg"];

#[must_use]
pub fn is_allowed_extension(ext: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(&ext)
}

/// Errors raised when a data-type name or upload segment is not recognized.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DataTypeError {
    #[error("[RD201] unknown data type '{0}'")]
    UnknownName(String),
    #[error("[RD202] unknown upload segment '{0}'")]
    UnknownSegment(String),
}

/// Closed set of sensor and survey streams a device can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Accelerometer,
    AppLog,
    Bluetooth,
    Calls,
    #[serde(rename = "devicemotion")]
    DeviceMotion,
    Gps,
    Gyro,
    Identifiers,
    IosLog,
    Magnetometer,
    PowerState,
    Proximity,
    Reachability,
    SurveyAnswers,
    SurveyTimings,
    Texts,
    AudioRecordings,
    ImageSurvey,
    Wifi,
}

impl DataType {
    pub const ALL: [DataType; 19] = [
        Self::Accelerometer,
        Self::AppLog,
        Self::Bluetooth,
        Self::Calls,
        Self::DeviceMotion,
        Self::Gps,
        Self::Gyro,
        Self::Identifiers,
        Self::IosLog,
        Self::Magnetometer,
        Self::PowerState,
        Self::Proximity,
        Self::Reachability,
        Self::SurveyAnswers,
        Self::SurveyTimings,
        Self::Texts,
        Self::AudioRecordings,
        Self::ImageSurvey,
        Self::Wifi,
    ];

    /// Canonical name used in chunk paths and the index.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::AppLog => "app_log",
            Self::Bluetooth => "bluetooth",
            Self::Calls => "calls",
            Self::DeviceMotion => "devicemotion",
            Self::Gps => "gps",
            Self::Gyro => "gyro",
            Self::Identifiers => "identifiers",
            Self::IosLog => "ios_log",
            Self::Magnetometer => "magnetometer",
            Self::PowerState => "power_state",
            Self::Proximity => "proximity",
            Self::Reachability => "reachability",
            Self::SurveyAnswers => "survey_answers",
            Self::SurveyTimings => "survey_timings",
            Self::Texts => "texts",
            Self::AudioRecordings => "audio_recordings",
            Self::ImageSurvey => "image_survey",
            Self::Wifi => "wifi",
        }
    }

    /// Segment the mobile app writes into its file names for this stream.
    #[must_use]
    pub fn upload_segment(self) -> &'static str {
        match self {
            Self::Accelerometer => "accel",
            Self::AppLog => "logFile",
            Self::Bluetooth => "bluetoothLog",
            Self::Calls => "callLog",
            Self::DeviceMotion => "devicemotion",
            Self::Gps => "gps",
            Self::Gyro => "gyro",
            Self::Identifiers => "identifiers",
            Self::IosLog => "ios_log",
            Self::Magnetometer => "magnetometer",
            Self::PowerState => "powerState",
            Self::Proximity => "proximity",
            Self::Reachability => "reachability",
            Self::SurveyAnswers => "surveyAnswers",
            Self::SurveyTimings => "surveyTimings",
            Self::Texts => "textsLog",
            Self::AudioRecordings => "voiceRecording",
            Self::ImageSurvey => "imageSurvey",
            Self::Wifi => "wifiLog",
        }
    }

    /// Resolve the segment found in a raw upload path.
    ///
    /// # Errors
    ///
    /// Returns [`DataTypeError::UnknownSegment`] when no stream uses `segment`.
    pub fn from_upload_segment(segment: &str) -> Result<Self, DataTypeError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.upload_segment() == segment)
            .ok_or_else(|| DataTypeError::UnknownSegment(segment.to_string()))
    }

    /// Whether observations of this stream are merged into hourly chunks.
    #[must_use]
    pub fn is_chunkable(self) -> bool {
        !matches!(
            self,
            Self::SurveyAnswers | Self::AudioRecordings | Self::ImageSurvey
        )
    }

    /// Streams whose paths may carry a survey id after the data-type segment.
    #[must_use]
    pub fn carries_survey(self) -> bool {
        matches!(
            self,
            Self::SurveyAnswers | Self::SurveyTimings | Self::AudioRecordings | Self::ImageSurvey
        )
    }

    /// Media streams count as a single observation per file.
    #[must_use]
    pub fn is_media(self) -> bool {
        matches!(self, Self::AudioRecordings | Self::ImageSurvey)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for DataType {
    type Error = DataTypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DataTypeError::UnknownName(value.to_string()))
    }
}

impl std::str::FromStr for DataType {
    type Err = DataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_segments_round_trip() {
        for kind in DataType::ALL {
            assert_eq!(DataType::try_from(kind.as_str()), Ok(kind));
            assert_eq!(DataType::from_upload_segment(kind.upload_segment()), Ok(kind));
        }
    }

    #[test]
    fn chunkable_set_excludes_media_and_answers() {
        let unchunkable: Vec<_> = DataType::ALL
            .into_iter()
            .filter(|kind| !kind.is_chunkable())
            .collect();
        assert_eq!(
            unchunkable,
            vec![
                DataType::SurveyAnswers,
                DataType::AudioRecordings,
                DataType::ImageSurvey
            ]
        );
        assert!(DataType::SurveyTimings.is_chunkable());
        assert!(DataType::SurveyTimings.carries_survey());
    }

    #[test]
    fn unknown_segment_is_rejected() {
        assert_eq!(
            DataType::from_upload_segment("rList"),
            Err(DataTypeError::UnknownSegment("rList".to_string()))
        );
    }

    #[test]
    fn serializes_as_canonical_name() {
        let json = serde_json::to_string(&DataType::PowerState).unwrap();
        assert_eq!(json, "\"power_state\"");
    }
}
