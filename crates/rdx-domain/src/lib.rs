//! Pure value logic shared by the ingestion pipeline: the stream taxonomy,
//! storage path grammar, chunk digests, time buckets and tabular bodies.

pub mod data_type;
pub mod hash;
pub mod path;
pub mod tabular;
pub mod time_bin;

pub use data_type::{is_allowed_extension, DataType, DataTypeError, ALLOWED_EXTENSIONS};
pub use hash::{chunk_hash, low_memory_chunk_hash, normalize_trailing_newline, observation_count, ChunkHasher};
pub use path::{
    chunk_path, identifiers_raw_path, key_path, parse, parse_file, qualify_device_file_name, raw_path,
    survey_id_of, unchunked_chunk_path, FileKind, KeyHalf, Layout, ParsedPath, PathError, PathRecord,
    CHUNKS_FOLDER, KEYS_FOLDER, RAW_DATA_FOLDER,
};
pub use tabular::{row_timecode, BinnedRows, Merged, TabularBody, TabularError, UploadBody};
pub use time_bin::{
    format_api_time, parse_api_time, timecode_secs, truncate_to_hour, TimeBin, TimeError,
    DEFAULT_QUANTUM_SECS,
};
