//! Ingestion, storage and chunking for participant device uploads.

pub mod alert;
pub mod backlog;
pub mod chunker;
pub mod chunks;
pub mod commands;
pub mod config;
pub mod context;
pub mod crypto;
pub mod directory;
pub mod index;
pub mod ingest;
pub mod keys;
pub mod lock;
pub mod outcome;
pub mod stats;
pub mod store;

pub use alert::{Alert, AlertKind, AlertSink, TracingAlerts};
pub use backlog::{Backlog, BacklogEntry};
pub use chunker::{Chunker, PassSummary, RecountSummary};
pub use chunks::{ChunkError, ChunkKey, ChunkQuery, ChunkRecord, ChunkRegistry};
pub use config::{ChunkingConfig, Config, KeyConfig, StoreConfig, ROOT_ENV};
pub use context::CommandContext;
pub use crypto::{decrypt_envelope, seal_device_file, CryptoGate, DecryptionFailure, FailureLedger, IndexLedger};
pub use directory::{Directory, DirectoryError, Participant, Study};
pub use index::{Index, IndexError};
pub use ingest::{DeviceRegistration, Ingestor, RegistrationOutcome, UploadDisposition, UploadRequest};
pub use lock::{LockError, LockGuard, ProcessingLock};
pub use outcome::{format_status_message, to_json_response, CommandInfo, CommandStatus, ExecutionOutcome};
pub use stats::{HourlyStat, Statistics, UploadStat, WeeklyUsage};
pub use store::{FsBackend, MemoryBackend, ObjectKey, ObjectStore, StoreError};
