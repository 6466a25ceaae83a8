use anyhow::Result;
use serde_json::json;

use crate::context::CommandContext;
use crate::outcome::ExecutionOutcome;
use crate::stats::Statistics;

use super::{parse_data_types, parse_time_arg, user_error_or_fail};

#[derive(Clone, Debug, Default)]
pub struct StatsShowRequest {
    pub participant: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StatsHourlyRequest {
    pub participant: String,
    pub data_type: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct StatsRebuildRequest;

#[derive(Clone, Debug)]
pub struct StatsPurgeRequest {
    pub participant: String,
}

#[derive(Clone, Debug)]
pub struct StatsWeeklyRequest {
    pub days: i64,
}

impl Default for StatsWeeklyRequest {
    fn default() -> Self {
        Self { days: 7 }
    }
}

pub fn stats_show(ctx: &CommandContext, request: &StatsShowRequest) -> Result<ExecutionOutcome> {
    let stats = Statistics::new(ctx.index().clone()).running(request.participant.as_deref())?;
    let uploads: u64 = stats.iter().map(|stat| stat.number_of_uploads).sum();
    Ok(ExecutionOutcome::success(
        format!("{uploads} uploads across {} streams", stats.len()),
        json!({ "stats": stats }),
    ))
}

pub fn stats_hourly(ctx: &CommandContext, request: &StatsHourlyRequest) -> Result<ExecutionOutcome> {
    if let Err(err) = ctx.directory().require_participant(&request.participant) {
        return user_error_or_fail(err);
    }
    let data_type = match request.data_type.as_ref() {
        Some(name) => match parse_data_types(std::slice::from_ref(name)) {
            Ok(kinds) => kinds.into_iter().next(),
            Err(outcome) => return Ok(outcome),
        },
        None => None,
    };
    let start = match parse_time_arg("--start", request.start.as_deref()) {
        Ok(start) => start,
        Err(outcome) => return Ok(outcome),
    };
    let end = match parse_time_arg("--end", request.end.as_deref()) {
        Ok(end) => end,
        Err(outcome) => return Ok(outcome),
    };
    let hours = Statistics::new(ctx.index().clone()).hourly(&request.participant, data_type, start, end)?;
    let observations: u64 = hours.iter().map(|hour| hour.number_of_observations).sum();
    Ok(ExecutionOutcome::success(
        format!("{} hourly buckets, {observations} observations", hours.len()),
        json!({ "hours": hours }),
    ))
}

/// Recompute running totals from the upload log.
pub fn stats_rebuild(ctx: &CommandContext, _request: &StatsRebuildRequest) -> Result<ExecutionOutcome> {
    let rows = Statistics::new(ctx.index().clone()).rebuild()?;
    Ok(ExecutionOutcome::success(
        format!("rebuilt {rows} running totals"),
        json!({ "rows": rows }),
    ))
}

pub fn stats_purge(ctx: &CommandContext, request: &StatsPurgeRequest) -> Result<ExecutionOutcome> {
    let removed = Statistics::new(ctx.index().clone()).purge(&request.participant)?;
    Ok(ExecutionOutcome::success(
        format!("purged {removed} statistics rows for {}", request.participant),
        json!({ "removed": removed }),
    ))
}

pub fn stats_weekly(ctx: &CommandContext, request: &StatsWeeklyRequest) -> Result<ExecutionOutcome> {
    if request.days <= 0 {
        return Ok(ExecutionOutcome::user_error(
            format!("--days must be positive (got {})", request.days),
            json!({}),
        ));
    }
    let usage = Statistics::new(ctx.index().clone()).weekly(request.days)?;
    Ok(ExecutionOutcome::success(
        format!("usage over the last {} days", request.days),
        json!({ "days": request.days, "usage": usage }),
    ))
}
