use anyhow::Result;
use serde_json::json;

use crate::context::CommandContext;
use crate::ingest::{DeviceRegistration, RegistrationOutcome};
use crate::outcome::ExecutionOutcome;

use super::user_error_or_fail;

#[derive(Clone, Debug)]
pub struct StudyCreateRequest {
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct ParticipantCreateRequest {
    /// Study object id or name.
    pub study: String,
}

#[derive(Clone, Debug)]
pub struct ParticipantRegisterRequest {
    pub patient_id: String,
    pub device_id: String,
    pub os_type: String,
}

pub fn study_create(ctx: &CommandContext, request: &StudyCreateRequest) -> Result<ExecutionOutcome> {
    let name = request.name.trim();
    if name.is_empty() {
        return Ok(ExecutionOutcome::user_error("study name must not be empty", json!({})));
    }
    match ctx.directory().create_study(name) {
        Ok(study) => Ok(ExecutionOutcome::success(
            format!("created study {} ({})", study.name, study.object_id),
            json!({ "study": study }),
        )),
        Err(err) => user_error_or_fail(err),
    }
}

pub fn participant_create(ctx: &CommandContext, request: &ParticipantCreateRequest) -> Result<ExecutionOutcome> {
    let study = match ctx.directory().resolve_study(&request.study) {
        Ok(study) => study,
        Err(err) => return user_error_or_fail(err),
    };
    let (participant, public_key) =
        ctx.directory()
            .create_participant(&study.object_id, ctx.store(), ctx.config().keys().rsa_bits)?;
    Ok(ExecutionOutcome::success(
        format!("created participant {} in {}", participant.patient_id, study.name),
        json!({
            "participant": participant,
            "public_key": public_key,
        }),
    ))
}

pub fn participant_register(ctx: &CommandContext, request: &ParticipantRegisterRequest) -> Result<ExecutionOutcome> {
    let registration = DeviceRegistration::new(&request.patient_id, &request.device_id, &request.os_type);
    let outcome = ctx.ingestor().register_device(&registration)?;
    let http_status = outcome.http_status();
    Ok(match outcome {
        RegistrationOutcome::Registered {
            public_key,
            identifiers_path,
        } => ExecutionOutcome::success(
            format!("registered device {} for {}", request.device_id, request.patient_id),
            json!({
                "http_status": http_status,
                "public_key": public_key,
                "identifiers_path": identifiers_path,
            }),
        ),
        RegistrationOutcome::UnknownParticipant => ExecutionOutcome::user_error(
            format!("participant '{}' does not exist", request.patient_id),
            json!({ "http_status": http_status }),
        ),
        RegistrationOutcome::DeviceMismatch => ExecutionOutcome::user_error(
            format!("{} is already registered to another device", request.patient_id),
            json!({ "http_status": http_status }),
        ),
        RegistrationOutcome::OsMismatch => ExecutionOutcome::user_error(
            format!("{} registered previously from a different OS", request.patient_id),
            json!({ "http_status": http_status }),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::context;
    use crate::outcome::CommandStatus;
    use tempfile::tempdir;

    #[test]
    fn duplicate_study_names_are_user_errors() -> Result<()> {
        let temp = tempdir()?;
        let (ctx, _) = context(&temp)?;
        let request = StudyCreateRequest { name: "sleep".into() };
        assert_eq!(study_create(&ctx, &request)?.status, CommandStatus::Ok);
        let again = study_create(&ctx, &request)?;
        assert_eq!(again.status, CommandStatus::UserError);
        assert_eq!(again.details["code"], "RD603");
        Ok(())
    }

    #[test]
    fn participants_are_created_by_study_name() -> Result<()> {
        let temp = tempdir()?;
        let (ctx, _) = context(&temp)?;
        study_create(&ctx, &StudyCreateRequest { name: "sleep".into() })?;
        let created = participant_create(&ctx, &ParticipantCreateRequest { study: "sleep".into() })?;
        assert_eq!(created.status, CommandStatus::Ok);
        assert_eq!(created.details["participant"]["patient_id"].as_str().map(str::len), Some(8));

        let missing = participant_create(&ctx, &ParticipantCreateRequest { study: "nope".into() })?;
        assert_eq!(missing.details["code"], "RD601");
        Ok(())
    }
}
