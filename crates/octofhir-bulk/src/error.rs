//! Error taxonomy for bulk jobs.
//!
//! Every failure is classified into one of four kinds so callers can decide
//! between skipping a record, retrying, stopping a partition or aborting the
//! whole job without string matching.

use std::fmt;

use octofhir_storage::StorageError;
use thiserror::Error;

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// One record could not be serialized or parsed; the partition continues.
    Record,
    /// Timeouts, throttling, dropped connections; retried with the same state.
    Transient,
    /// The partition stops advancing; its last checkpoint stays resumable.
    Partition,
    /// Nothing can be done for the job as a whole.
    Job,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record => write!(f, "record"),
            Self::Transient => write!(f, "transient"),
            Self::Partition => write!(f, "partition"),
            Self::Job => write!(f, "job"),
        }
    }
}

/// Typed reason for a storage provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFailure {
    NotFound,
    Throttled,
    Timeout,
    Unavailable,
    Unsupported,
    Integrity,
    Denied,
    Other,
}

impl StorageFailure {
    /// Failures worth repeating with the same request.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Throttled | Self::Timeout | Self::Unavailable)
    }

    /// Classify an HTTP status returned by an object store or HTTPS source.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::NotFound,
            401 | 403 => Self::Denied,
            408 => Self::Timeout,
            429 => Self::Throttled,
            405 | 501 => Self::Unsupported,
            500 | 502 | 503 | 504 => Self::Unavailable,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StorageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Unsupported => "unsupported",
            Self::Integrity => "integrity violation",
            Self::Denied => "access denied",
            Self::Other => "failed",
        };
        f.write_str(s)
    }
}

/// Errors produced by the bulk engine.
#[derive(Debug, Error)]
pub enum BulkError {
    #[error("storage {op} on '{location}' {kind}: {message}")]
    Storage {
        op: &'static str,
        location: String,
        kind: StorageFailure,
        message: String,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("record {position} rejected: {message}")]
    Record { position: u64, message: String },

    #[error("multi-part upload for '{location}' is inconsistent: {message}")]
    UploadIntegrity { location: String, message: String },

    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<BulkError>,
    },

    #[error("planning failed for source '{source_id}': {message}")]
    Planning { source_id: String, message: String },

    #[error("invalid object path '{path}': {message}")]
    InvalidObjectPath { path: String, message: String },

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("unknown storage type '{0}'")]
    UnknownStorageType(String),

    #[error("no partitions could be planned: {0}")]
    NothingToDo(String),

    #[error("storage backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulkError {
    pub fn storage(
        op: &'static str,
        location: impl Into<String>,
        kind: StorageFailure,
        message: impl fmt::Display,
    ) -> Self {
        Self::Storage {
            op,
            location: location.into(),
            kind,
            message: message.to_string(),
        }
    }

    pub fn planning(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Planning {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn integrity(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UploadIntegrity {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Where this error sits in the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Record { .. } => ErrorKind::Record,
            Self::Storage { kind, .. } if kind.is_transient() => ErrorKind::Transient,
            Self::Persistence(e) if e.is_transient() => ErrorKind::Transient,
            Self::Io(e) if is_transient_io(e) => ErrorKind::Transient,
            Self::Storage { .. }
            | Self::Persistence(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::UploadIntegrity { .. }
            | Self::RetriesExhausted { .. }
            | Self::Planning { .. }
            | Self::InvalidObjectPath { .. } => ErrorKind::Partition,
            Self::InvalidRequest(_)
            | Self::UnknownStorageType(_)
            | Self::NothingToDo(_)
            | Self::BackendUnreachable(_)
            | Self::Config(_) => ErrorKind::Job,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_partition_fatal(&self) -> bool {
        self.kind() == ErrorKind::Partition
    }

    pub fn is_job_fatal(&self) -> bool {
        self.kind() == ErrorKind::Job
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind as Io;
    matches!(
        err.kind(),
        Io::TimedOut | Io::Interrupted | Io::ConnectionReset | Io::ConnectionAborted | Io::WouldBlock
    )
}

pub type BulkResult<T> = Result<T, BulkError>;
