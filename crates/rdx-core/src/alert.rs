//! Operator-facing alert channel.

use std::fmt;

use serde::Serialize;
use tracing::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// An upload could not be decrypted at all; the device was still acknowledged.
    DecryptionFailure,
    /// A device sent a crash log.
    CrashLog,
    /// A chunking pass could not finish.
    ChunkingFailure,
    /// An upload was refused in a way the device will keep retrying.
    RejectedUpload,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DecryptionFailure => "decryption_failure",
            Self::CrashLog => "crash_log",
            Self::ChunkingFailure => "chunking_failure",
            Self::RejectedUpload => "rejected_upload",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub subject: String,
    pub detail: String,
}

impl Alert {
    pub fn new(kind: AlertKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Emits alerts as error events on the `rdx::alert` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn raise(&self, alert: Alert) {
        error!(
            target: "rdx::alert",
            kind = %alert.kind,
            subject = %alert.subject,
            detail = %alert.detail,
            "operator alert"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{Alert, AlertSink};

    #[derive(Default)]
    pub(crate) struct RecordingAlerts {
        raised: Mutex<Vec<Alert>>,
    }

    impl RecordingAlerts {
        pub(crate) fn raised(&self) -> Vec<Alert> {
            self.raised.lock().unwrap().clone()
        }
    }

    impl AlertSink for RecordingAlerts {
        fn raise(&self, alert: Alert) {
            self.raised.lock().unwrap().push(alert);
        }
    }
}
