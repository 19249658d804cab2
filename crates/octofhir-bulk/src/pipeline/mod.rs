//! Partition processing.
//!
//! Export and import share one driver, [`PartitionRunner`], and differ only
//! in the [`RecordSource`] and [`RecordSink`] they plug into it. Within a
//! partition everything is sequential: one page is read, handed to the sink,
//! and only then is the page counter advanced.

pub mod export;
pub mod import;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointState;
use crate::context::JobContext;
use crate::error::BulkResult;
use crate::planner::PartitionDescriptor;
use crate::tracker::Ticket;

pub use export::{ExportSink, ExportSource};
pub use import::{ImportSink, ImportSource};
pub use retry::RetryPolicy;

/// Produces pages of records for one partition.
#[async_trait]
pub trait RecordSource: Send {
    type Item: Send;

    /// Next page at `state.page_number`, or `None` once exhausted. May move
    /// the state to the next type filter, never to the next page.
    async fn next_page(&mut self, state: &mut CheckpointState) -> BulkResult<Option<Vec<Self::Item>>>;
}

/// Consumes pages for one partition.
#[async_trait]
pub trait RecordSink: Send {
    type Item: Send;

    /// Process one page. Returns `true` when everything accepted so far is
    /// durable, i.e. the state is a safe resume point once the page counter
    /// has advanced.
    async fn accept_page(
        &mut self,
        page: Vec<Self::Item>,
        state: &mut CheckpointState,
    ) -> BulkResult<bool>;

    /// Make everything accepted so far durable without finishing the
    /// partition. Returns `false` when that is not possible yet; the last
    /// durable state is then the resume point.
    async fn suspend(&mut self, _state: &mut CheckpointState) -> BulkResult<bool> {
        Ok(true)
    }

    /// Make the remaining output durable.
    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<PartitionOutput>;
}

/// Receives resumable snapshots of partition progress.
pub trait CheckpointListener: Send + Sync {
    fn on_checkpoint(&self, descriptor: &PartitionDescriptor, state: &CheckpointState);
}

impl<F> CheckpointListener for F
where
    F: Fn(&PartitionDescriptor, &CheckpointState) + Send + Sync,
{
    fn on_checkpoint(&self, descriptor: &PartitionDescriptor, state: &CheckpointState) {
        self(descriptor, state)
    }
}

/// Listener that drops every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl CheckpointListener for NoopListener {
    fn on_checkpoint(&self, _descriptor: &PartitionDescriptor, _state: &CheckpointState) {}
}

/// One produced object, as listed in an export manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    pub count: u64,
}

/// A rejected record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    /// 1-based line number within the source, or 0 when unknown.
    pub position: u64,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
}

/// Bounded list of record outcomes; every failure is counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeLog {
    pub entries: Vec<RecordOutcome>,
    pub dropped: u64,
    #[serde(skip)]
    capacity: usize,
}

impl OutcomeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            dropped: 0,
            capacity,
        }
    }

    pub fn push(&mut self, outcome: RecordOutcome) {
        if self.entries.len() < self.capacity {
            self.entries.push(outcome);
        } else {
            self.dropped += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.entries.len() as u64 + self.dropped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOutput {
    pub outputs: Vec<OutputFile>,
    pub outcomes: OutcomeLog,
}

/// How a partition run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed(PartitionOutput),
    /// Stopped at a page boundary; the state is resumable.
    Cancelled,
}

/// Drives one partition from its current state to completion.
pub struct PartitionRunner<'a> {
    pub descriptor: PartitionDescriptor,
    pub ctx: &'a JobContext,
    pub listener: &'a dyn CheckpointListener,
    /// Completed once when the source is exhausted and once when the sink
    /// finished.
    pub ticket: Option<Ticket<u32>>,
    last_durable: Option<CheckpointState>,
}

impl<'a> PartitionRunner<'a> {
    pub fn new(descriptor: PartitionDescriptor, ctx: &'a JobContext, listener: &'a dyn CheckpointListener) -> Self {
        Self {
            descriptor,
            ctx,
            listener,
            ticket: None,
            last_durable: None,
        }
    }

    pub fn with_ticket(mut self, ticket: Ticket<u32>) -> Self {
        self.ticket = Some(ticket);
        self
    }

    fn checkpoint(&mut self, state: &CheckpointState) {
        self.descriptor.type_filter_index = state.current_type_filter_index;
        self.listener.on_checkpoint(&self.descriptor, state);
        self.last_durable = Some(state.clone());
    }

    /// Most recent state handed to the listener during `run`.
    pub fn last_durable(&self) -> Option<&CheckpointState> {
        self.last_durable.as_ref()
    }

    pub async fn run<S, K, T>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        state: &mut CheckpointState,
    ) -> BulkResult<RunEnd>
    where
        S: RecordSource<Item = T>,
        K: RecordSink<Item = T>,
        T: Send,
    {
        loop {
            if self.ctx.is_cancelled() {
                tracing::info!(
                    job_id = %self.ctx.job_id,
                    partition = self.descriptor.ordinal,
                    page = state.page_number,
                    "partition cancelled at page boundary"
                );
                if sink.suspend(state).await? {
                    self.checkpoint(state);
                }
                return Ok(RunEnd::Cancelled);
            }
            let Some(page) = source.next_page(state).await? else {
                break;
            };
            let records = page.len();
            let durable = sink.accept_page(page, state).await?;
            state.advance_page();
            tracing::debug!(
                partition = self.descriptor.ordinal,
                page = state.page_number,
                records,
                durable,
                "page processed"
            );
            if durable {
                self.checkpoint(state);
            }
        }
        if let Some(ticket) = &self.ticket {
            ticket.complete();
        }

        let output = sink.finish(state).await?;
        state.complete = true;
        self.checkpoint(state);
        if let Some(ticket) = &self.ticket {
            ticket.complete();
        }
        tracing::info!(
            job_id = %self.ctx.job_id,
            partition = self.descriptor.ordinal,
            resources = state.resources_written,
            failures = state.record_failures,
            summary = %state.summary_string(),
            "partition completed"
        );
        Ok(RunEnd::Completed(output))
    }
}
