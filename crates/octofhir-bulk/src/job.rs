//! Job execution.
//!
//! [`JobRunner`] plans a request, processes the partitions on a bounded pool
//! of workers and folds the results into a [`JobReport`]. A shared
//! [`CheckpointTracker`] keyed by partition ordinal exposes the job-wide
//! resume point while partitions finish in any order.

use std::collections::BTreeMap;
use std::sync::Arc;

use octofhir_storage::DynStorage;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::checkpoint::CheckpointState;
use crate::codec::{JsonCodec, OutputFormat, ResourceCodec};
use crate::config::BulkDataConfig;
use crate::context::JobContext;
use crate::error::{BulkError, BulkResult, ErrorKind};
use crate::pipeline::{
    CheckpointListener, ExportSink, ExportSource, ImportSink, ImportSource, NoopListener,
    OutcomeLog, OutputFile, PartitionRunner, RetryPolicy, RunEnd,
};
use crate::planner::{
    BulkOperation, JobRequest, Partition, PartitionDescriptor, PartitionPlanner, PlanningFailure,
};
use crate::provider::{ProviderRegistry, StorageProvider};
use crate::tracker::{CheckpointTracker, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Completed,
    /// Stopped on a partition-fatal error; resumable from `state`.
    Failed,
    /// Stopped by cancellation; resumable from `state`.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BulkError> for PartitionError {
    fn from(err: &BulkError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReport {
    pub descriptor: PartitionDescriptor,
    pub status: PartitionStatus,
    /// Last durable state; pass it back to resume the partition.
    pub state: CheckpointState,
    #[serde(default)]
    pub outputs: Vec<OutputFile>,
    #[serde(default)]
    pub outcomes: OutcomeLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PartitionError>,
}

/// Overall result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Every partition completed without record failures.
    Complete,
    /// Some work was done, but partitions, sources or records failed.
    PartialSuccess,
    /// No partition completed.
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub transaction_time: OffsetDateTime,
    pub partitions: Vec<PartitionReport>,
    #[serde(default)]
    pub planning_failures: Vec<PlanningFailure>,
    /// Highest ordinal up to which every partition is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u32>,
}

impl JobReport {
    pub fn outcome(&self) -> JobOutcome {
        let count = |status| self.partitions.iter().filter(|p| p.status == status).count();
        if count(PartitionStatus::Cancelled) > 0 {
            return JobOutcome::Cancelled;
        }
        let completed = count(PartitionStatus::Completed);
        if completed == 0 {
            return JobOutcome::Failed;
        }
        if completed == self.partitions.len()
            && self.planning_failures.is_empty()
            && self.record_failures() == 0
        {
            JobOutcome::Complete
        } else {
            JobOutcome::PartialSuccess
        }
    }

    pub fn record_failures(&self) -> u64 {
        self.partitions.iter().map(|p| p.state.record_failures).sum()
    }

    pub fn resources_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.state.resources_written).sum()
    }

    /// Manifest entries of every completed partition.
    pub fn outputs(&self) -> Vec<&OutputFile> {
        self.partitions.iter().flat_map(|p| p.outputs.iter()).collect()
    }

    /// States to pass to [`JobRunner::resume`].
    pub fn resume_states(&self) -> BTreeMap<u32, CheckpointState> {
        self.partitions
            .iter()
            .map(|p| (p.descriptor.ordinal, p.state.clone()))
            .collect()
    }
}

#[derive(Clone)]
pub struct JobRunner {
    registry: ProviderRegistry,
    storage: DynStorage,
    codec: Arc<dyn ResourceCodec>,
    config: Arc<BulkDataConfig>,
    listener: Arc<dyn CheckpointListener>,
}

/// What a worker needs, cloned into each task.
#[derive(Clone)]
struct Worker {
    ctx: JobContext,
    storage: DynStorage,
    provider: Arc<dyn StorageProvider>,
    codec: Arc<dyn ResourceCodec>,
    config: Arc<BulkDataConfig>,
    listener: Arc<dyn CheckpointListener>,
    export: Option<(OutputFormat, Option<OffsetDateTime>)>,
    page_size: usize,
}

impl JobRunner {
    pub fn new(config: BulkDataConfig, storage: DynStorage) -> Self {
        Self {
            registry: ProviderRegistry::with_defaults(),
            storage,
            codec: Arc::new(JsonCodec),
            config: Arc::new(config),
            listener: Arc::new(NoopListener),
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ResourceCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CheckpointListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &BulkDataConfig {
        &self.config
    }

    pub async fn run(&self, ctx: &JobContext, request: &JobRequest) -> BulkResult<JobReport> {
        self.resume(ctx, request, &BTreeMap::new()).await
    }

    /// Run a job, continuing partitions from `previous` states (by ordinal).
    ///
    /// Returns `Err` only for job-fatal failures; partition failures are part
    /// of the report.
    pub async fn resume(
        &self,
        ctx: &JobContext,
        request: &JobRequest,
        previous: &BTreeMap<u32, CheckpointState>,
    ) -> BulkResult<JobReport> {
        request.validate()?;
        if !request.output_format.is_line_oriented() && !self.codec.supports_columnar() {
            return Err(BulkError::InvalidRequest(format!(
                "output format {:?} is not supported by the configured codec",
                request.output_format
            )));
        }
        let provider = self
            .registry
            .create(request.storage_type, &self.config.storage, ctx)?;
        let planner = PartitionPlanner::new(&self.config);
        let retry = RetryPolicy::from_settings(&self.config.jobs);

        let export = match &request.operation {
            BulkOperation::Export(export) => {
                let base = planner.export_base(ctx);
                retry
                    .run("ensure_destination", || provider.ensure_destination_exists(&base))
                    .await
                    .map_err(|e| BulkError::BackendUnreachable(e.to_string()))?;
                Some((request.output_format, export.since))
            }
            BulkOperation::Import(_) => None,
        };

        let plan = planner
            .plan(ctx, request, self.storage.as_ref(), provider.as_ref())
            .await?;
        let (partitions, planning_failures) = plan.into_partitions()?;

        let page_size = request.page_size.unwrap_or(if export.is_some() {
            self.config.export.page_size
        } else {
            self.config.import.batch_size
        });
        let workers = request
            .max_concurrent_partitions
            .unwrap_or(self.config.jobs.max_concurrent_partitions)
            .max(1);
        tracing::info!(
            job_id = %ctx.job_id,
            partitions = partitions.len(),
            workers,
            storage_type = %request.storage_type,
            "job started"
        );

        let worker = Worker {
            ctx: ctx.clone(),
            storage: self.storage.clone(),
            provider,
            codec: self.codec.clone(),
            config: self.config.clone(),
            listener: self.listener.clone(),
            export,
            page_size,
        };
        let tracker = CheckpointTracker::<u32>::new();
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut in_flight: BTreeMap<u32, (PartitionDescriptor, CheckpointState)> = BTreeMap::new();
        let mut reports = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let ticket = tracker.track(partition.ordinal, 2);
            let state = previous
                .get(&partition.ordinal)
                .cloned()
                .unwrap_or_else(CheckpointState::new);
            if state.complete {
                ticket.complete();
                ticket.complete();
                reports.push(worker.already_complete(&partition, state));
                continue;
            }
            let descriptor = partition.descriptor(state.current_type_filter_index);
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let initial = state.clone();
            let span = tracing::info_span!(
                "partition",
                job_id = %ctx.job_id,
                partition = partition.ordinal,
                resource_type = %partition.resource_type
            );
            in_flight.insert(partition.ordinal, (descriptor, initial));
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    worker.process(partition, state, ticket).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    in_flight.remove(&report.descriptor.ordinal);
                    reports.push(report);
                }
                Err(e) => {
                    tracing::error!(job_id = %ctx.job_id, error = %e, "partition worker died");
                }
            }
        }
        // Whatever did not report back died with its worker.
        for (_, (descriptor, state)) in in_flight {
            reports.push(PartitionReport {
                descriptor,
                status: PartitionStatus::Failed,
                state,
                outputs: Vec::new(),
                outcomes: OutcomeLog::default(),
                error: Some(PartitionError {
                    kind: ErrorKind::Partition,
                    message: "partition worker terminated unexpectedly".into(),
                }),
            });
        }
        reports.sort_by_key(|r| r.descriptor.ordinal);

        let report = JobReport {
            job_id: ctx.job_id,
            transaction_time: OffsetDateTime::now_utc(),
            partitions: reports,
            planning_failures,
            checkpoint: tracker.checkpoint(),
        };
        tracing::info!(
            job_id = %ctx.job_id,
            outcome = ?report.outcome(),
            resources = report.resources_written(),
            record_failures = report.record_failures(),
            checkpoint = ?report.checkpoint,
            "job finished"
        );
        Ok(report)
    }
}

impl Worker {
    fn already_complete(&self, partition: &Partition, state: CheckpointState) -> PartitionReport {
        let outputs = if state.resources_written > 0 || self.export.is_none() {
            vec![OutputFile {
                resource_type: partition.resource_type.clone(),
                url: partition.storage_location.clone(),
                count: state.resources_written,
            }]
        } else {
            Vec::new()
        };
        PartitionReport {
            descriptor: partition.descriptor(state.current_type_filter_index),
            status: PartitionStatus::Completed,
            state,
            outputs,
            outcomes: OutcomeLog::default(),
            error: None,
        }
    }

    async fn process(
        &self,
        partition: Partition,
        mut state: CheckpointState,
        ticket: Ticket<u32>,
    ) -> PartitionReport {
        let initial = state.clone();
        let retry = RetryPolicy::from_settings(&self.config.jobs);
        let max_outcomes = self.config.jobs.max_outcome_entries;
        let descriptor = partition.descriptor(state.current_type_filter_index);
        let mut runner =
            PartitionRunner::new(descriptor, &self.ctx, self.listener.as_ref()).with_ticket(ticket);

        let result = match &self.export {
            Some((format, since)) => {
                let built = ExportSource::new(
                    self.storage.clone(),
                    partition.clone(),
                    self.page_size,
                    *since,
                    retry,
                )
                .and_then(|source| {
                    ExportSink::new(
                        self.provider.clone(),
                        self.codec.clone(),
                        &partition,
                        *format,
                        &self.config.export,
                        retry,
                        max_outcomes,
                        &state,
                    )
                    .map(|sink| (source, sink))
                });
                match built {
                    Ok((mut source, mut sink)) => match source.written_ids(&state).await {
                        Ok(ids) => {
                            sink.remember_written(&ids);
                            runner.run(&mut source, &mut sink, &mut state).await
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
            None => {
                let mut source = ImportSource::new(
                    self.provider.clone(),
                    partition.clone(),
                    self.page_size,
                    retry,
                );
                let mut sink = ImportSink::new(
                    self.storage.clone(),
                    self.codec.clone(),
                    &partition,
                    retry,
                    max_outcomes,
                );
                runner.run(&mut source, &mut sink, &mut state).await
            }
        };

        let durable = runner.last_durable().cloned().unwrap_or(initial);
        match result {
            Ok(RunEnd::Completed(output)) => PartitionReport {
                descriptor: partition.descriptor(state.current_type_filter_index),
                status: PartitionStatus::Completed,
                state,
                outputs: output.outputs,
                outcomes: output.outcomes,
                error: None,
            },
            Ok(RunEnd::Cancelled) => PartitionReport {
                descriptor: partition.descriptor(durable.current_type_filter_index),
                status: PartitionStatus::Cancelled,
                state: durable,
                outputs: Vec::new(),
                outcomes: OutcomeLog::default(),
                error: None,
            },
            Err(e) => {
                tracing::error!(
                    job_id = %self.ctx.job_id,
                    partition = partition.ordinal,
                    kind = %e.kind(),
                    error = %e,
                    "partition failed"
                );
                PartitionReport {
                    descriptor: partition.descriptor(durable.current_type_filter_index),
                    status: PartitionStatus::Failed,
                    state: durable,
                    outputs: Vec::new(),
                    outcomes: OutcomeLog::default(),
                    error: Some(PartitionError::from(&e)),
                }
            }
        }
    }
}
