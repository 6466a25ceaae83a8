//! Operator command entry points. Each returns an [`ExecutionOutcome`];
//! `Err` is reserved for failures the caller cannot act on.

use anyhow::Error;
use rdx_domain::{parse_api_time, DataType, DataTypeError, TimeError};
use serde_json::json;

use crate::directory::DirectoryError;
use crate::lock::LockError;
use crate::outcome::ExecutionOutcome;

pub mod chunk;
pub mod lock;
pub mod stats;
pub mod study;
pub mod upload;

pub use chunk::{chunk_pass, chunks_list, chunks_recount, ChunkFilter, ChunkPassRequest};
pub use lock::{lock_clear, lock_status, LockClearRequest, LockStatusRequest};
pub use stats::{
    stats_hourly, stats_purge, stats_rebuild, stats_show, stats_weekly, StatsHourlyRequest, StatsPurgeRequest,
    StatsRebuildRequest, StatsShowRequest, StatsWeeklyRequest,
};
pub use study::{
    participant_create, participant_register, study_create, ParticipantCreateRequest,
    ParticipantRegisterRequest, StudyCreateRequest,
};
pub use upload::{device_seal, upload, DeviceSealRequest, UploadCommandRequest};

/// Turns typed errors an operator can fix into a user-error outcome.
pub(crate) fn user_error_outcome(err: &Error) -> Option<ExecutionOutcome> {
    if let Some(dir) = err.downcast_ref::<DirectoryError>() {
        return Some(ExecutionOutcome::user_error(
            dir.to_string(),
            json!({ "code": dir.code() }),
        ));
    }
    if let Some(lock) = err.downcast_ref::<LockError>() {
        let LockError::FileProcessingLocked { locked_at } = lock;
        return Some(ExecutionOutcome::user_error(
            lock.to_string(),
            json!({
                "code": lock.code(),
                "locked_at": locked_at,
                "hint": "wait for the running pass or run `rdx lock clear` if it died",
            }),
        ));
    }
    None
}

/// The user-error outcome for `err`, or `err` itself when no operator
/// action can fix it.
pub(crate) fn user_error_or_fail(err: Error) -> anyhow::Result<ExecutionOutcome> {
    user_error_outcome(&err).ok_or(err)
}

pub(crate) fn parse_time_arg(flag: &str, value: Option<&str>) -> Result<Option<i64>, ExecutionOutcome> {
    value
        .map(|text| {
            parse_api_time(text).map_err(|err: TimeError| {
                ExecutionOutcome::user_error(
                    format!("invalid {flag}: {err}"),
                    json!({ "hint": "use YYYY-MM-DDTHH:MM:SS" }),
                )
            })
        })
        .transpose()
}

pub(crate) fn parse_data_types(names: &[String]) -> Result<Vec<DataType>, ExecutionOutcome> {
    names
        .iter()
        .map(|name| {
            name.parse::<DataType>().map_err(|err: DataTypeError| {
                ExecutionOutcome::user_error(
                    err.to_string(),
                    json!({ "valid": DataType::ALL.iter().map(|kind| kind.as_str()).collect::<Vec<_>>() }),
                )
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use tempfile::TempDir;

    use crate::alert::testing::RecordingAlerts;
    use crate::config::{Config, KeyConfig, StoreConfig};
    use crate::context::CommandContext;

    pub(crate) fn context(temp: &TempDir) -> Result<(CommandContext, Arc<RecordingAlerts>)> {
        let config = Config::for_root(temp.path())
            .with_store(StoreConfig {
                retries: 0,
                retry_delay: Duration::ZERO,
                list_page_size: 100,
            })
            .with_keys(KeyConfig { rsa_bits: 1024 });
        let alerts = Arc::new(RecordingAlerts::default());
        Ok((CommandContext::with_alerts(config, alerts.clone())?, alerts))
    }
}
