use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::error;

use crate::context::CommandContext;
use crate::crypto::seal_device_file;
use crate::ingest::{UploadDisposition, UploadRequest};
use crate::keys::client_public_key;
use crate::outcome::ExecutionOutcome;

use super::user_error_or_fail;

/// Encrypt a plaintext file the way a participant's device would.
#[derive(Clone, Debug)]
pub struct DeviceSealRequest {
    pub patient_id: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Clone, Debug)]
pub struct UploadCommandRequest {
    pub patient_id: String,
    pub path: PathBuf,
    /// Name reported by the device; defaults to the file's own name.
    pub file_name: Option<String>,
}

pub fn device_seal(ctx: &CommandContext, request: &DeviceSealRequest) -> Result<ExecutionOutcome> {
    let participant = match ctx.directory().require_participant(&request.patient_id) {
        Ok(participant) => participant,
        Err(err) => return user_error_or_fail(err),
    };
    let plaintext =
        fs::read(&request.input).with_context(|| format!("failed to read {}", request.input.display()))?;
    let public_key = client_public_key(ctx.store(), &participant.study_id, &participant.patient_id)?;
    let sealed = seal_device_file(&plaintext, &public_key)?;
    fs::write(&request.output, &sealed)
        .with_context(|| format!("failed to write {}", request.output.display()))?;
    Ok(ExecutionOutcome::success(
        format!("sealed {} for {}", request.output.display(), participant.patient_id),
        json!({
            "output": request.output.display().to_string(),
            "bytes": sealed.len(),
        }),
    ))
}

pub fn upload(ctx: &CommandContext, request: &UploadCommandRequest) -> Result<ExecutionOutcome> {
    let body = fs::read(&request.path).with_context(|| format!("failed to read {}", request.path.display()))?;
    let file_name = request.file_name.clone().or_else(|| {
        request
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    });
    let result = ctx.ingestor().handle_upload(&UploadRequest {
        patient_id: &request.patient_id,
        file_name: file_name.as_deref(),
        body: &body,
    });
    let disposition = match result {
        Ok(disposition) => disposition,
        Err(err) => {
            error!(patient_id = %request.patient_id, error = %err, "upload failed before it was stored");
            return Ok(ExecutionOutcome::failure(
                format!("upload failed: {err:#}"),
                json!({ "http_status": 500, "acknowledged": false }),
            ));
        }
    };

    let mut details = json!({
        "state": disposition.state(),
        "http_status": disposition.http_status(),
        "acknowledged": disposition.acknowledged(),
    });
    match &disposition {
        UploadDisposition::Enqueued {
            raw_path,
            newly_queued,
        } => {
            details["raw_path"] = json!(raw_path);
            details["newly_queued"] = json!(newly_queued);
        }
        UploadDisposition::RejectedBadExtension { extension } => {
            details["extension"] = json!(extension);
        }
        UploadDisposition::DecryptFailedReport { code } => {
            details["code"] = json!(code);
        }
        _ => {}
    }
    let message = format!("{}: {}", file_name.as_deref().unwrap_or("<unnamed>"), disposition.state());
    Ok(match disposition {
        UploadDisposition::Enqueued { .. } | UploadDisposition::CrashLogForwarded | UploadDisposition::Ignored => {
            ExecutionOutcome::success(message, details)
        }
        _ => ExecutionOutcome::user_error(message, details),
    })
}
