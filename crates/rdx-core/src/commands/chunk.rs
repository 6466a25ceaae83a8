use anyhow::Result;
use serde_json::json;
use tracing::error;

use crate::alert::{Alert, AlertKind};
use crate::chunker::Chunker;
use crate::chunks::{ChunkQuery, ChunkRegistry};
use crate::context::CommandContext;
use crate::outcome::ExecutionOutcome;

use super::{parse_data_types, parse_time_arg, user_error_or_fail, user_error_outcome};

#[derive(Clone, Debug, Default)]
pub struct ChunkPassRequest;

/// Selection shared by `chunks list` and `chunks recount`.
#[derive(Clone, Debug, Default)]
pub struct ChunkFilter {
    /// Study object id or name.
    pub study: String,
    pub participants: Vec<String>,
    pub data_types: Vec<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// A filter either becomes a registry query or is turned away with the
/// outcome to report.
enum FilterResolution {
    Query(ChunkQuery),
    Rejected(ExecutionOutcome),
}

impl ChunkFilter {
    fn resolve(&self, ctx: &CommandContext) -> Result<FilterResolution> {
        let study = match ctx.directory().resolve_study(&self.study) {
            Ok(study) => study,
            Err(err) => return user_error_or_fail(err).map(FilterResolution::Rejected),
        };
        let data_types = match parse_data_types(&self.data_types) {
            Ok(kinds) => kinds,
            Err(outcome) => return Ok(FilterResolution::Rejected(outcome)),
        };
        let start = match parse_time_arg("--start", self.start.as_deref()) {
            Ok(start) => start,
            Err(outcome) => return Ok(FilterResolution::Rejected(outcome)),
        };
        let end = match parse_time_arg("--end", self.end.as_deref()) {
            Ok(end) => end,
            Err(outcome) => return Ok(FilterResolution::Rejected(outcome)),
        };
        Ok(FilterResolution::Query(ChunkQuery {
            study_id: study.object_id,
            participants: self.participants.clone(),
            data_types,
            start,
            end,
        }))
    }
}

/// Run one chunking pass over the backlog.
pub fn chunk_pass(ctx: &CommandContext, _request: &ChunkPassRequest) -> Result<ExecutionOutcome> {
    let chunker = Chunker::new(ctx.index(), ctx.store().clone(), *ctx.config().chunking());
    match chunker.run_pass() {
        Ok(summary) => Ok(ExecutionOutcome::success(
            format!(
                "processed {} entries ({} skipped, {} retained)",
                summary.entries_processed, summary.entries_skipped, summary.entries_retained
            ),
            json!({ "summary": summary }),
        )),
        Err(err) => {
            if let Some(outcome) = user_error_outcome(&err) {
                return Ok(outcome);
            }
            error!(error = %err, "chunking pass failed");
            ctx.alerts()
                .raise(Alert::new(AlertKind::ChunkingFailure, "chunker", format!("{err:#}")));
            Ok(ExecutionOutcome::failure(
                format!("chunking pass failed: {err:#}"),
                json!({}),
            ))
        }
    }
}

pub fn chunks_list(ctx: &CommandContext, filter: &ChunkFilter) -> Result<ExecutionOutcome> {
    let query = match filter.resolve(ctx)? {
        FilterResolution::Query(query) => query,
        FilterResolution::Rejected(outcome) => return Ok(outcome),
    };
    let chunks = ChunkRegistry::new(ctx.index().clone()).query(&query)?;
    let observations: u64 = chunks.iter().map(|chunk| chunk.number_of_observations).sum();
    Ok(ExecutionOutcome::success(
        format!("{} chunks, {observations} observations", chunks.len()),
        json!({
            "count": chunks.len(),
            "observations": observations,
            "chunks": chunks,
        }),
    ))
}

/// Recompute hashes and observation counts from stored chunk content.
pub fn chunks_recount(ctx: &CommandContext, filter: &ChunkFilter) -> Result<ExecutionOutcome> {
    let query = match filter.resolve(ctx)? {
        FilterResolution::Query(query) => query,
        FilterResolution::Rejected(outcome) => return Ok(outcome),
    };
    let chunker = Chunker::new(ctx.index(), ctx.store().clone(), *ctx.config().chunking());
    let summary = chunker.recount(&query)?;
    Ok(ExecutionOutcome::success(
        format!(
            "checked {} chunks, updated {}, missing {}",
            summary.checked, summary.updated, summary.missing
        ),
        json!({ "summary": summary }),
    ))
}
