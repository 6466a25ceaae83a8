use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::context::CommandContext;
use crate::lock::ProcessingLock;
use crate::outcome::ExecutionOutcome;

#[derive(Clone, Debug, Default)]
pub struct LockStatusRequest;

#[derive(Clone, Debug, Default)]
pub struct LockClearRequest;

pub fn lock_status(ctx: &CommandContext, _request: &LockStatusRequest) -> Result<ExecutionOutcome> {
    let lock = ProcessingLock::new(ctx.index().clone());
    let locked_at = lock.locked_at()?;
    let held_secs = lock.time_since_locked()?.map(|held| held.as_secs());
    let message = match held_secs {
        Some(secs) => format!("locked for {secs}s"),
        None => "unlocked".to_string(),
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({
            "locked": locked_at.is_some(),
            "locked_at": locked_at,
            "held_secs": held_secs,
        }),
    ))
}

/// Drop a lock left behind by a pass that died.
pub fn lock_clear(ctx: &CommandContext, _request: &LockClearRequest) -> Result<ExecutionOutcome> {
    let removed = ProcessingLock::new(ctx.index().clone()).unlock()?;
    if removed > 0 {
        warn!(removed, "processing lock cleared by operator");
    }
    Ok(ExecutionOutcome::success(
        if removed > 0 { "lock cleared" } else { "no lock was held" },
        json!({ "removed": removed }),
    ))
}
