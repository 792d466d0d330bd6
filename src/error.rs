use std::path::PathBuf;

use thiserror::Error;

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A unique/default/status invariant would be broken by the
    /// requested mutation. The mutation was rolled back.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A persisted value no longer decodes into its closed enum or
    /// versioned record type.
    #[error("invalid persisted value in column {column}: {value:?}")]
    InvalidValue { column: &'static str, value: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures of a single encoding job.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("transcoder exited with {0}")]
    TranscoderCrashed(String),

    #[error("output file missing or empty: {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("finalise failed: {0}")]
    FinaliseFailed(String),

    #[error("planning failed: {0}")]
    PlanningFailed(String),

    /// The item was already finalised by an earlier run; the
    /// filesystem was not touched.
    #[error("item already finalised")]
    AlreadyFinalised,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the upscale pre-stage. These never fail the enclosing
/// job; the supervisor falls back to the original source.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("unknown upscaler: {0}")]
    UnknownUpscaler(String),

    #[error("upscaler binary not installed: {0}")]
    BinaryNotFound(String),

    #[error("could not determine source dimensions for {}", .0.display())]
    UnknownDimensions(PathBuf),

    /// Source is already close enough to the target height.
    #[error("source height {source_height} is within reach of target {target}")]
    AlreadyCloseEnough { source_height: u32, target: u32 },

    #[error("insufficient disk space: need {need_bytes} bytes, {free_bytes} free")]
    InsufficientDiskSpace { need_bytes: u64, free_bytes: u64 },

    #[error("frame extraction failed: {0}")]
    ExtractFailed(String),

    #[error("upscaler exited with {0}")]
    UpscalerFailed(String),

    #[error("reassembly failed: {0}")]
    ReassembleFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to external catalog services.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot connect to {0} — is it running?")]
    Unreachable(String),

    #[error("connection timed out")]
    Timeout,

    #[error("invalid API key (401 Unauthorized)")]
    Unauthorized,

    #[error("HTTP {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    BadResponse(String),

    #[error("API key decryption failed: {0}")]
    Crypto(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Collapse a reqwest error into the closed taxonomy so callers
    /// see friendly, stable messages.
    pub fn from_transport(err: reqwest::Error, base_url: &str) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_connect() {
            SyncError::Unreachable(base_url.to_string())
        } else if let Some(status) = err.status() {
            if status.as_u16() == 401 {
                SyncError::Unauthorized
            } else {
                SyncError::Http(status.as_u16())
            }
        } else {
            SyncError::Transport(err)
        }
    }
}
