use std::io;

use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rdx_core::commands::{
    self, ChunkFilter, ChunkPassRequest, DeviceSealRequest, LockClearRequest, LockStatusRequest,
    ParticipantCreateRequest, ParticipantRegisterRequest, StatsHourlyRequest, StatsPurgeRequest,
    StatsRebuildRequest, StatsShowRequest, StatsWeeklyRequest, StudyCreateRequest, UploadCommandRequest,
};
use rdx_core::{CommandContext, CommandInfo, CommandStatus, Config, ExecutionOutcome};
use serde_json::Value;

mod cli;
mod style;

use cli::{
    ChunkFilterArgs, ChunksCommand, CommandGroupCli, DeviceCommand, LockCommand, ParticipantCommand, RdxCli,
    StatsCommand, StudyCommand,
};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = RdxCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let config = Config::from_env(cli.root.as_deref()).map_err(|err| eyre!("{err:?}"))?;
    let ctx = CommandContext::open(config).map_err(|err| eyre!("{err:?}"))?;
    let info = command_info(&cli.command);
    let outcome = dispatch(&ctx, &cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, info, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("rdx={level},rdx_core={level},rdx_cli={level},rdx_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn command_info(command: &CommandGroupCli) -> CommandInfo {
    match command {
        CommandGroupCli::Study(StudyCommand::Create { .. }) => CommandInfo::new("study", "create"),
        CommandGroupCli::Participant(ParticipantCommand::Create { .. }) => CommandInfo::new("participant", "create"),
        CommandGroupCli::Participant(ParticipantCommand::Register { .. }) => {
            CommandInfo::new("participant", "register")
        }
        CommandGroupCli::Device(DeviceCommand::Seal { .. }) => CommandInfo::new("device", "seal"),
        CommandGroupCli::Upload(_) => CommandInfo::new("upload", "upload"),
        CommandGroupCli::Chunk => CommandInfo::new("chunk", "chunk"),
        CommandGroupCli::Chunks(ChunksCommand::List(_)) => CommandInfo::new("chunks", "list"),
        CommandGroupCli::Chunks(ChunksCommand::Recount(_)) => CommandInfo::new("chunks", "recount"),
        CommandGroupCli::Stats(StatsCommand::Show { .. }) => CommandInfo::new("stats", "show"),
        CommandGroupCli::Stats(StatsCommand::Hourly { .. }) => CommandInfo::new("stats", "hourly"),
        CommandGroupCli::Stats(StatsCommand::Rebuild) => CommandInfo::new("stats", "rebuild"),
        CommandGroupCli::Stats(StatsCommand::Purge { .. }) => CommandInfo::new("stats", "purge"),
        CommandGroupCli::Stats(StatsCommand::Weekly { .. }) => CommandInfo::new("stats", "weekly"),
        CommandGroupCli::Lock(LockCommand::Status) => CommandInfo::new("lock", "status"),
        CommandGroupCli::Lock(LockCommand::Clear) => CommandInfo::new("lock", "clear"),
    }
}

fn dispatch(ctx: &CommandContext, command: &CommandGroupCli) -> anyhow::Result<ExecutionOutcome> {
    match command {
        CommandGroupCli::Study(StudyCommand::Create { name }) => {
            commands::study_create(ctx, &StudyCreateRequest { name: name.clone() })
        }
        CommandGroupCli::Participant(ParticipantCommand::Create { study }) => {
            commands::participant_create(ctx, &ParticipantCreateRequest { study: study.clone() })
        }
        CommandGroupCli::Participant(ParticipantCommand::Register {
            patient_id,
            device_id,
            os,
        }) => commands::participant_register(
            ctx,
            &ParticipantRegisterRequest {
                patient_id: patient_id.clone(),
                device_id: device_id.clone(),
                os_type: os.clone(),
            },
        ),
        CommandGroupCli::Device(DeviceCommand::Seal {
            patient_id,
            input,
            output,
        }) => commands::device_seal(
            ctx,
            &DeviceSealRequest {
                patient_id: patient_id.clone(),
                input: input.clone(),
                output: output.clone(),
            },
        ),
        CommandGroupCli::Upload(args) => commands::upload(
            ctx,
            &UploadCommandRequest {
                patient_id: args.patient_id.clone(),
                path: args.file.clone(),
                file_name: args.file_name.clone(),
            },
        ),
        CommandGroupCli::Chunk => commands::chunk_pass(ctx, &ChunkPassRequest),
        CommandGroupCli::Chunks(ChunksCommand::List(args)) => commands::chunks_list(ctx, &chunk_filter(args)),
        CommandGroupCli::Chunks(ChunksCommand::Recount(args)) => {
            commands::chunks_recount(ctx, &chunk_filter(args))
        }
        CommandGroupCli::Stats(StatsCommand::Show { participant }) => commands::stats_show(
            ctx,
            &StatsShowRequest {
                participant: participant.clone(),
            },
        ),
        CommandGroupCli::Stats(StatsCommand::Hourly {
            participant,
            data_type,
            start,
            end,
        }) => commands::stats_hourly(
            ctx,
            &StatsHourlyRequest {
                participant: participant.clone(),
                data_type: data_type.clone(),
                start: start.clone(),
                end: end.clone(),
            },
        ),
        CommandGroupCli::Stats(StatsCommand::Rebuild) => commands::stats_rebuild(ctx, &StatsRebuildRequest),
        CommandGroupCli::Stats(StatsCommand::Purge { participant }) => commands::stats_purge(
            ctx,
            &StatsPurgeRequest {
                participant: participant.clone(),
            },
        ),
        CommandGroupCli::Stats(StatsCommand::Weekly { days }) => {
            commands::stats_weekly(ctx, &StatsWeeklyRequest { days: *days })
        }
        CommandGroupCli::Lock(LockCommand::Status) => commands::lock_status(ctx, &LockStatusRequest),
        CommandGroupCli::Lock(LockCommand::Clear) => commands::lock_clear(ctx, &LockClearRequest),
    }
}

fn chunk_filter(args: &ChunkFilterArgs) -> ChunkFilter {
    ChunkFilter {
        study: args.study.clone(),
        participants: args.participants.clone(),
        data_types: args.data_types.clone(),
        start: args.start.clone(),
        end: args.end.clone(),
    }
}

fn emit_output(cli: &RdxCli, info: CommandInfo, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = match outcome.status {
        CommandStatus::Ok => 0,
        CommandStatus::UserError => 1,
        CommandStatus::Failure => 2,
    };

    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = rdx_core::to_json_response(info, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet {
        let message = rdx_core::format_status_message(info, &outcome.message);
        println!("{}", style.status(&outcome.status, &message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
        if let Some(table) = render_table(&style, info, &outcome.details) {
            println!("{table}");
        }
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn render_table(style: &Style, info: CommandInfo, details: &Value) -> Option<String> {
    let (rows_key, columns): (&str, &[&str]) = match (info.group, info.name) {
        ("stats", "show") => (
            "stats",
            &["participant_id", "data_type", "number_of_uploads", "number_bytes_uploaded"],
        ),
        ("stats", "hourly") => ("hours", &["data_type", "hour", "number_of_uploads", "number_of_observations"]),
        ("stats", "weekly") => ("usage", &["data_type", "uploads", "megabytes"]),
        ("chunks", "list") => ("chunks", &["chunk_path", "number_of_observations"]),
        _ => return None,
    };
    let rows = details.get(rows_key)?.as_array()?;
    if rows.is_empty() {
        return None;
    }
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| columns.iter().map(|column| cell(row.get(*column))).collect())
        .collect();
    Some(format_table(style, columns, &cells))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

fn format_table(style: &Style, columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|column| column.len()).collect();
    for row in rows {
        for (idx, value) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(value.len());
        }
    }
    let render = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(value, &width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let mut lines = vec![style.table_header(&render(columns.to_vec()))];
    for row in rows {
        lines.push(render(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}
