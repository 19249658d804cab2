//! Import strategies: raw records come from a storage provider, parsed
//! resources go to persistence in bounded batches.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use octofhir_storage::DynStorage;
use serde_json::Value;

use super::retry::RetryPolicy;
use super::{OutcomeLog, OutputFile, PartitionOutput, RecordOutcome, RecordSink, RecordSource};
use crate::checkpoint::CheckpointState;
use crate::codec::{ResourceCodec, resource_id_of, resource_type_of};
use crate::error::{BulkError, BulkResult};
use crate::planner::Partition;
use crate::provider::{ByteRange, RecordStream, StorageProvider};

/// One raw record and its 1-based record number within the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub position: u64,
    pub bytes: Bytes,
}

/// Streams raw records from the partition's object (or byte range).
///
/// A page is `batch_size` records, so page `n` starts after `n * batch_size`
/// records. Dropped connections are healed by reopening the object with an
/// updated skip count.
pub struct ImportSource {
    provider: Arc<dyn StorageProvider>,
    partition: Partition,
    batch_size: usize,
    retry: RetryPolicy,
    stream: Option<RecordStream>,
    exhausted: bool,
}

impl ImportSource {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        partition: Partition,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            partition,
            batch_size: batch_size.max(1),
            retry,
            stream: None,
            exhausted: false,
        }
    }

    /// Opens the source at record `skip`. The returned future does not
    /// borrow `self`.
    fn open(&self, skip: u64) -> impl Future<Output = BulkResult<RecordStream>> + Send + use<> {
        open_records(
            self.provider.clone(),
            self.partition.storage_location.clone(),
            self.partition.range,
            self.retry,
            skip,
        )
    }
}

async fn open_records(
    provider: Arc<dyn StorageProvider>,
    location: String,
    range: Option<ByteRange>,
    retry: RetryPolicy,
    skip: u64,
) -> BulkResult<RecordStream> {
    tracing::debug!(%location, skip, ?range, "opening import source");
    let provider = &provider;
    let location = location.as_str();
    retry
        .run("open", || async move {
            match range {
                Some(range) => provider.open_segment(location, range, skip).await,
                None => provider.open_for_read(location, skip).await,
            }
        })
        .await
}

#[async_trait]
impl RecordSource for ImportSource {
    type Item = RawRecord;

    async fn next_page(&mut self, state: &mut CheckpointState) -> BulkResult<Option<Vec<RawRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        let first = state.page_number.saturating_mul(self.batch_size as u64);
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.open(first).await?,
        };

        let mut lines: Vec<Bytes> = Vec::with_capacity(self.batch_size);
        let mut failures = 0;
        while lines.len() < self.batch_size {
            match stream.next().await {
                Some(Ok(line)) => lines.push(line),
                Some(Err(e)) => {
                    failures += 1;
                    let delay = self.retry.on_failure("read", failures, e)?;
                    tokio::time::sleep(delay).await;
                    stream = self.open(first + lines.len() as u64).await?;
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if !self.exhausted {
            self.stream = Some(stream);
        }
        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            lines
                .into_iter()
                .enumerate()
                .map(|(i, bytes)| RawRecord {
                    position: first + i as u64 + 1,
                    bytes,
                })
                .collect(),
        ))
    }
}

/// Parses, validates and persists records.
pub struct ImportSink {
    storage: DynStorage,
    codec: Arc<dyn ResourceCodec>,
    resource_type: String,
    location: String,
    retry: RetryPolicy,
    outcomes: OutcomeLog,
}

impl ImportSink {
    pub fn new(
        storage: DynStorage,
        codec: Arc<dyn ResourceCodec>,
        partition: &Partition,
        retry: RetryPolicy,
        max_outcome_entries: usize,
    ) -> Self {
        Self {
            storage,
            codec,
            resource_type: partition.resource_type.clone(),
            location: partition.storage_location.clone(),
            retry,
            outcomes: OutcomeLog::new(max_outcome_entries),
        }
    }

    fn reject(
        &mut self,
        state: &mut CheckpointState,
        position: u64,
        id: Option<String>,
        message: String,
    ) {
        state.record_failure(&self.resource_type);
        tracing::warn!(
            location = %self.location,
            position,
            id = id.as_deref().unwrap_or("-"),
            %message,
            "record rejected"
        );
        self.outcomes.push(RecordOutcome {
            position,
            resource_type: self.resource_type.clone(),
            id,
            message,
        });
    }

    async fn persist(&self, resources: &[Value]) -> BulkResult<usize> {
        let storage = &self.storage;
        self.retry
            .run("upsert_batch", || async move {
                storage
                    .upsert_batch(resources)
                    .await
                    .map(|stored| stored.len())
                    .map_err(BulkError::from)
            })
            .await
    }
}

#[async_trait]
impl RecordSink for ImportSink {
    type Item = RawRecord;

    async fn accept_page(&mut self, page: Vec<RawRecord>, state: &mut CheckpointState) -> BulkResult<bool> {
        let mut batch: Vec<(u64, Value, u64)> = Vec::with_capacity(page.len());
        for record in page {
            let resource = match self.codec.parse(&record.bytes) {
                Ok(resource) => resource,
                Err(e) => {
                    self.reject(state, record.position, None, e.to_string());
                    continue;
                }
            };
            let found = resource_type_of(&resource).map(str::to_string);
            if found.as_deref() != Some(self.resource_type.as_str()) {
                let message = format!(
                    "expected resourceType '{}', found {:?}",
                    self.resource_type, found
                );
                let id = resource_id_of(&resource).map(str::to_string);
                self.reject(state, record.position, id, message);
                continue;
            }
            batch.push((record.position, resource, record.bytes.len() as u64));
        }
        if batch.is_empty() {
            return Ok(true);
        }

        let resources: Vec<Value> = batch.iter().map(|(_, r, _)| r.clone()).collect();
        match self.persist(&resources).await {
            Ok(_) => {
                let bytes: u64 = batch.iter().map(|(_, _, b)| *b).sum();
                state.record_written(&self.resource_type, batch.len() as u64, bytes);
            }
            Err(BulkError::Persistence(e)) if !e.is_transient() => {
                // Isolate the offending records.
                tracing::debug!(location = %self.location, error = %e, "batch rejected, persisting records one by one");
                for (position, resource, bytes) in batch {
                    match self.persist(std::slice::from_ref(&resource)).await {
                        Ok(_) => state.record_written(&self.resource_type, 1, bytes),
                        Err(BulkError::Persistence(e)) if !e.is_transient() => {
                            let id = resource_id_of(&resource).map(str::to_string);
                            self.reject(state, position, id, e.to_string());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<PartitionOutput> {
        Ok(PartitionOutput {
            outputs: vec![OutputFile {
                resource_type: self.resource_type.clone(),
                url: self.location.clone(),
                count: state.resources_written,
            }],
            outcomes: std::mem::take(&mut self.outcomes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ByteRange, FileProvider};

    fn partition(range: Option<ByteRange>) -> Partition {
        Partition {
            ordinal: 0,
            source_id: "Patient.ndjson".into(),
            resource_type: "Patient".into(),
            type_filters: Vec::new(),
            members: Vec::new(),
            storage_location: "Patient.ndjson".into(),
            range,
        }
    }

    async fn read_pages(mut source: ImportSource, start_page: u64) -> BulkResult<Vec<Vec<u64>>> {
        let mut state = CheckpointState::new();
        state.page_number = start_page;
        let mut pages = Vec::new();
        while let Some(page) = source.next_page(&mut state).await? {
            pages.push(page.iter().map(|r| r.position).collect());
            state.advance_page();
        }
        Ok(pages)
    }

    #[tokio::test]
    async fn test_pages_can_be_read_on_a_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Patient.ndjson"), "a\nb\nc\nd\ne\n").unwrap();
        let provider: Arc<dyn StorageProvider> = Arc::new(FileProvider::new(dir.path()));
        let source = ImportSource::new(provider, partition(None), 2, RetryPolicy::none());

        // Resuming at page 1 skips the first batch.
        let pages = tokio::spawn(read_pages(source, 1)).await.unwrap().unwrap();
        assert_eq!(pages, vec![vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_segment_pages_number_records_from_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Patient.ndjson"), "l1\nl2\nl3\nl4\n").unwrap();
        let provider: Arc<dyn StorageProvider> = Arc::new(FileProvider::new(dir.path()));
        let source = ImportSource::new(
            provider,
            partition(Some(ByteRange::new(3, 12))),
            2,
            RetryPolicy::none(),
        );

        let pages = tokio::spawn(read_pages(source, 0)).await.unwrap().unwrap();
        assert_eq!(pages, vec![vec![1, 2], vec![3]]);
    }
}
