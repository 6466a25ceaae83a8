use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const RDX_HELP_TEMPLATE: &str = "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const RDX_BEFORE_HELP: &str = concat!(
    "rdx ",
    env!("CARGO_PKG_VERSION"),
    " – research data exchange\n\n",
    "\x1b[1;36mSetup\x1b[0m\n",
    "  study            Create studies.\n",
    "  participant      Create participants and register their devices.\n\n",
    "\x1b[1;36mIngestion\x1b[0m\n",
    "  device seal      Encrypt a file the way a participant's phone does.\n",
    "  upload           Submit a device file through the upload path.\n",
    "  chunk            Fold queued uploads into hourly chunks.\n\n",
    "\x1b[1;36mInspection\x1b[0m\n",
    "  chunks           List chunks or recount their observations.\n",
    "  stats            Upload and observation statistics.\n",
    "  lock             Inspect or clear the chunking lock.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "rdx",
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = RDX_BEFORE_HELP,
    help_template = RDX_HELP_TEMPLATE
)]
pub struct RdxCli {
    #[arg(long, value_name = "DIR", help = "Data root (overrides RDX_ROOT)", global = true)]
    pub root: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(long, help = "Emit {status,message,details} JSON envelopes", global = true)]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(subcommand, about = "Manage studies")]
    Study(StudyCommand),
    #[command(subcommand, about = "Manage participants and device registration")]
    Participant(ParticipantCommand),
    #[command(subcommand, about = "Device-side helpers")]
    Device(DeviceCommand),
    #[command(about = "Submit one device file as an upload")]
    Upload(UploadArgs),
    #[command(about = "Run one chunking pass over the upload backlog")]
    Chunk,
    #[command(subcommand, about = "Inspect and maintain chunks")]
    Chunks(ChunksCommand),
    #[command(subcommand, about = "Upload and observation statistics")]
    Stats(StatsCommand),
    #[command(subcommand, about = "Inspect or clear the chunking lock")]
    Lock(LockCommand),
}

#[derive(Subcommand, Debug)]
pub enum StudyCommand {
    #[command(about = "Create a study with a fresh storage key")]
    Create {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ParticipantCommand {
    #[command(about = "Create a participant and its key pair")]
    Create {
        #[arg(long, value_name = "STUDY", help = "Study id or name")]
        study: String,
    },
    #[command(about = "Register a device for a participant")]
    Register {
        #[arg(value_name = "PATIENT_ID")]
        patient_id: String,
        #[arg(long, value_name = "ID")]
        device_id: String,
        #[arg(long, value_name = "OS", default_value = "ANDROID")]
        os: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    #[command(about = "Encrypt a plaintext file with a participant's public key")]
    Seal {
        #[arg(value_name = "PATIENT_ID")]
        patient_id: String,
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(value_name = "PATIENT_ID")]
    pub patient_id: String,
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
    #[arg(long, value_name = "NAME", help = "File name the device reports (defaults to FILE's name)")]
    pub file_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ChunkFilterArgs {
    #[arg(long, value_name = "STUDY", help = "Study id or name")]
    pub study: String,
    #[arg(long = "participant", value_name = "ID")]
    pub participants: Vec<String>,
    #[arg(long = "data-type", value_name = "TYPE")]
    pub data_types: Vec<String>,
    #[arg(long, value_name = "YYYY-MM-DDTHH:MM:SS")]
    pub start: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DDTHH:MM:SS")]
    pub end: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ChunksCommand {
    #[command(about = "List chunks matching a filter")]
    List(ChunkFilterArgs),
    #[command(about = "Recompute hashes and observation counts from stored chunks")]
    Recount(ChunkFilterArgs),
}

#[derive(Subcommand, Debug)]
pub enum StatsCommand {
    #[command(about = "Running upload totals")]
    Show {
        #[arg(long, value_name = "ID")]
        participant: Option<String>,
    },
    #[command(about = "Hourly buckets for one participant")]
    Hourly {
        #[arg(value_name = "PATIENT_ID")]
        participant: String,
        #[arg(long = "data-type", value_name = "TYPE")]
        data_type: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DDTHH:MM:SS")]
        start: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DDTHH:MM:SS")]
        end: Option<String>,
    },
    #[command(about = "Recompute running totals from the upload log")]
    Rebuild,
    #[command(about = "Delete a participant's statistics")]
    Purge {
        #[arg(value_name = "PATIENT_ID")]
        participant: String,
    },
    #[command(about = "Uploads and megabytes per data type over a trailing window")]
    Weekly {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    #[command(about = "Show whether a chunking pass holds the lock")]
    Status,
    #[command(about = "Release a lock left by a dead pass")]
    Clear,
}
