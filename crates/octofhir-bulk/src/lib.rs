//! # octofhir-bulk
//!
//! Checkpointed, partitioned bulk FHIR export and import.
//!
//! A job is planned into independent partitions ([`planner`]), each driven
//! page by page by a [`pipeline::PartitionRunner`]. Export output is buffered
//! into multipart uploads ([`chunk`]) on a pluggable [`provider`]; import
//! streams line-delimited records from a provider into persistence. Progress
//! is captured in a serializable [`checkpoint::CheckpointState`] per
//! partition, and [`tracker::CheckpointTracker`] exposes a job-wide resume
//! point while partitions finish out of order.
//!
//! ```ignore
//! use octofhir_bulk::{BulkDataConfig, ExportRequest, JobContext, JobRequest, JobRunner, StorageType};
//!
//! let runner = JobRunner::new(BulkDataConfig::default(), storage);
//! let report = runner
//!     .run(&JobContext::default(), &JobRequest::export(StorageType::File, ExportRequest::default()))
//!     .await?;
//! for file in report.outputs() {
//!     println!("{} {} ({})", file.resource_type, file.url, file.count);
//! }
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod observability;
pub mod payload_key;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod tracker;

pub use checkpoint::{CheckpointState, CompletedPart, TypeSummary};
pub use chunk::{ChunkBuffer, FlushResult, UploadSummary};
pub use codec::{JsonCodec, OutputFormat, ResourceCodec};
pub use config::BulkDataConfig;
pub use context::JobContext;
pub use error::{BulkError, BulkResult, ErrorKind, StorageFailure};
pub use job::{JobOutcome, JobReport, JobRunner, PartitionReport, PartitionStatus};
pub use observability::{apply_logging_level, init_tracing};
pub use payload_key::PayloadKey;
pub use pipeline::{CheckpointListener, OutputFile, RecordOutcome, RetryPolicy};
pub use planner::{
    BulkOperation, ExportRequest, ExportScope, ImportInput, ImportRequest, JobRequest,
    Partition, PartitionDescriptor, PartitionPlanner,
};
pub use provider::{ByteRange, ProviderRegistry, StorageProvider, StorageType};
pub use tracker::CheckpointTracker;
