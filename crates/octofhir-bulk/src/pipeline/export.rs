//! Export strategies: pages come from a persistence search, records go to a
//! [`ChunkBuffer`] (or straight to storage for columnar output).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use octofhir_storage::{DynStorage, SearchParams, SearchResult};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::retry::RetryPolicy;
use super::{OutcomeLog, OutputFile, PartitionOutput, RecordOutcome, RecordSink, RecordSource};
use crate::checkpoint::CheckpointState;
use crate::chunk::{ChunkBuffer, record_flush};
use crate::codec::{OutputFormat, ResourceCodec, resource_id_of};
use crate::config::ExportSettings;
use crate::error::{BulkError, BulkResult};
use crate::planner::Partition;
use crate::provider::StorageProvider;

/// Paging parameters owned by the engine; filters cannot override them.
const RESERVED_PARAMS: &[&str] = &["_count", "_offset", "_sort", "_total", "_elements"];

/// Reads a partition's resources page by page, walking its type filters in
/// order.
pub struct ExportSource {
    storage: DynStorage,
    partition: Partition,
    page_size: usize,
    since: Option<String>,
    retry: RetryPolicy,
}

impl ExportSource {
    pub fn new(
        storage: DynStorage,
        partition: Partition,
        page_size: usize,
        since: Option<OffsetDateTime>,
        retry: RetryPolicy,
    ) -> BulkResult<Self> {
        let since = since
            .map(|s| s.format(&Rfc3339))
            .transpose()
            .map_err(|e| BulkError::InvalidRequest(format!("invalid _since: {e}")))?;
        Ok(Self {
            storage,
            partition,
            page_size: page_size.max(1),
            since,
            retry,
        })
    }

    /// Search parameters for page `page` of filter `filter_index`.
    pub fn params_for(&self, filter_index: usize, page: u64) -> SearchParams {
        let offset = (page.saturating_mul(self.page_size as u64)).min(u32::MAX as u64) as u32;
        let mut params = SearchParams::new()
            .with_count(self.page_size.min(u32::MAX as usize) as u32)
            .with_offset(offset)
            .with_sort("_id", false);
        if let Some(since) = &self.since {
            params = params.with_param("_lastUpdated", format!("ge{since}"));
        }
        if let Some(query) = self.partition.type_filters.get(filter_index) {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if RESERVED_PARAMS.contains(&key.as_ref()) {
                    continue;
                }
                params = params.with_param(key.into_owned(), value.into_owned());
            }
        }
        let members = &self.partition.members;
        if !members.is_empty() {
            params = if self.partition.resource_type == "Patient" {
                params.with_param("_id", members.join(","))
            } else {
                let refs: Vec<String> = members.iter().map(|m| format!("Patient/{m}")).collect();
                params.with_param("patient", refs.join(","))
            };
        }
        params
    }

    async fn search(&self, filter_index: usize, page: u64) -> BulkResult<SearchResult> {
        let params = &self.params_for(filter_index, page);
        let storage = &self.storage;
        let resource_type = self.partition.resource_type.as_str();
        self.retry
            .run("search", || async move {
                storage
                    .search(resource_type, params)
                    .await
                    .map_err(BulkError::from)
            })
            .await
    }

    /// Ids of the records written by the pages before `state.page_number`.
    ///
    /// Only needed across type filters: within one filter pages never
    /// overlap, so a single-filter partition returns nothing.
    pub async fn written_ids(&self, state: &CheckpointState) -> BulkResult<Vec<String>> {
        let passes = self.partition.filter_passes();
        if passes < 2 || state.page_number == 0 {
            return Ok(Vec::new());
        }
        let current = state.current_type_filter_index.min(passes - 1);
        let mut ids = Vec::new();
        for filter_index in 0..=current {
            let pages = (filter_index == current).then(|| state.page_within_filter());
            let mut page = 0;
            while pages.is_none_or(|pages| page < pages) {
                let result = self.search(filter_index, page).await?;
                ids.extend(
                    result
                        .entries
                        .iter()
                        .filter_map(|e| resource_id_of(&e.resource).map(str::to_string)),
                );
                if !result.has_more || result.entries.is_empty() {
                    break;
                }
                page += 1;
            }
        }
        tracing::debug!(
            partition = self.partition.ordinal,
            filter_index = current,
            ids = ids.len(),
            "replayed ids written before the checkpoint"
        );
        Ok(ids)
    }
}

#[async_trait]
impl RecordSource for ExportSource {
    type Item = Value;

    async fn next_page(&mut self, state: &mut CheckpointState) -> BulkResult<Option<Vec<Value>>> {
        let passes = self.partition.filter_passes();
        loop {
            let filter_index = state.current_type_filter_index;
            if filter_index >= passes {
                return Ok(None);
            }
            let filter_done = state
                .last_page_number
                .is_some_and(|last| state.page_number > last);
            if !filter_done {
                let result = self.search(filter_index, state.page_within_filter()).await?;
                if !result.has_more {
                    state.last_page_number = Some(state.page_number);
                }
                if !result.entries.is_empty() {
                    return Ok(Some(result.entries.into_iter().map(|e| e.resource).collect()));
                }
            }
            if filter_index + 1 >= passes {
                return Ok(None);
            }
            tracing::debug!(
                partition = self.partition.ordinal,
                filter_index = filter_index + 1,
                "moving to next type filter"
            );
            state.advance_type_filter();
        }
    }
}

/// Serializes resources into the partition's output object.
pub struct ExportSink {
    provider: Arc<dyn StorageProvider>,
    codec: Arc<dyn ResourceCodec>,
    resource_type: String,
    location: String,
    format: OutputFormat,
    chunk: Option<ChunkBuffer>,
    threshold_bytes: usize,
    threshold_records: usize,
    retry: RetryPolicy,
    outcomes: OutcomeLog,
    objects: Vec<OutputFile>,
}

impl ExportSink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        codec: Arc<dyn ResourceCodec>,
        partition: &Partition,
        format: OutputFormat,
        settings: &ExportSettings,
        retry: RetryPolicy,
        max_outcome_entries: usize,
        state: &CheckpointState,
    ) -> BulkResult<Self> {
        if !format.is_line_oriented() && !codec.supports_columnar() {
            return Err(BulkError::InvalidRequest(format!(
                "output format {format:?} is not supported by the configured codec"
            )));
        }
        let chunk = format.is_line_oriented().then(|| {
            ChunkBuffer::new(provider.clone(), partition.storage_location.clone())
                .with_dedup_capacity(settings.dedup_capacity)
                .with_retry(retry)
                .restore(state)
        });
        Ok(Self {
            provider,
            codec,
            resource_type: partition.resource_type.clone(),
            location: partition.storage_location.clone(),
            format,
            chunk,
            threshold_bytes: settings.part_upload_trigger_bytes,
            threshold_records: settings.max_records_per_part,
            retry,
            outcomes: OutcomeLog::new(max_outcome_entries),
            objects: Vec::new(),
        })
    }

    /// Seed duplicate detection with ids written by an earlier attempt.
    pub fn remember_written(&mut self, ids: &[String]) {
        if let Some(chunk) = self.chunk.as_mut() {
            for id in ids {
                chunk.remember(id);
            }
        }
    }

    fn page_location(&self, page: u64) -> String {
        let ext = self.format.file_extension();
        let stem = self
            .location
            .strip_suffix(&format!(".{ext}"))
            .unwrap_or(&self.location);
        format!("{stem}_{page:05}.{ext}")
    }

    fn record_failure(&mut self, state: &mut CheckpointState, resource: &Value, err: &BulkError) {
        state.record_failure(&self.resource_type);
        let id = resource_id_of(resource).map(str::to_string);
        tracing::warn!(
            resource_type = %self.resource_type,
            id = id.as_deref().unwrap_or("-"),
            error = %err,
            "skipping resource that failed to serialize"
        );
        self.outcomes.push(RecordOutcome {
            position: 0,
            resource_type: self.resource_type.clone(),
            id,
            message: err.to_string(),
        });
    }

    async fn write_columnar(&mut self, page: Vec<Value>, state: &mut CheckpointState) -> BulkResult<()> {
        let body = Bytes::from(self.codec.encode_columnar(&self.resource_type, &page)?);
        let location = self.page_location(state.page_number);
        let bytes = body.len() as u64;
        let provider = &self.provider;
        self.retry
            .run("put_object", || provider.put_object(&location, body.clone()))
            .await?;
        state.record_written(&self.resource_type, page.len() as u64, bytes);
        self.objects.push(OutputFile {
            resource_type: self.resource_type.clone(),
            url: location,
            count: page.len() as u64,
        });
        Ok(())
    }
}

#[async_trait]
impl RecordSink for ExportSink {
    type Item = Value;

    async fn accept_page(&mut self, page: Vec<Value>, state: &mut CheckpointState) -> BulkResult<bool> {
        if self.chunk.is_none() {
            self.write_columnar(page, state).await?;
            return Ok(true);
        }

        for resource in &page {
            let bytes = match self.codec.serialize(resource) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.record_failure(state, resource, &e);
                    continue;
                }
            };
            let Some(chunk) = self.chunk.as_mut() else {
                break;
            };
            let appended = match resource_id_of(resource) {
                Some(id) => chunk.append_unique(id, &bytes),
                None => {
                    chunk.append(&bytes);
                    true
                }
            };
            if !appended {
                continue;
            }
            if let Some(flush) = chunk
                .flush_if_needed(self.threshold_bytes, self.threshold_records)
                .await?
            {
                record_flush(state, &self.resource_type, &flush);
            }
        }
        Ok(self.chunk.as_ref().is_none_or(ChunkBuffer::is_empty))
    }

    async fn suspend(&mut self, state: &mut CheckpointState) -> BulkResult<bool> {
        let Some(chunk) = self.chunk.as_mut() else {
            return Ok(true);
        };
        if !chunk.can_flush_part() {
            tracing::debug!(
                location = %self.location,
                bytes = chunk.buffered_bytes(),
                "buffer is below the minimum part size, resuming from the last durable page"
            );
            return Ok(false);
        }
        if let Some(flush) = chunk.flush().await? {
            record_flush(state, &self.resource_type, &flush);
        }
        Ok(true)
    }

    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<PartitionOutput> {
        let mut outputs = std::mem::take(&mut self.objects);
        if let Some(chunk) = self.chunk.take() {
            let (summary, last) = chunk.finalize().await?;
            if let Some(flush) = last {
                record_flush(state, &self.resource_type, &flush);
            }
            if let Some(summary) = summary {
                outputs.push(OutputFile {
                    resource_type: self.resource_type.clone(),
                    url: summary.location,
                    count: state.resources_written,
                });
            }
            state.clear_upload();
        } else if state.resources_written > 0 && outputs.is_empty() {
            tracing::debug!(location = %self.location, "columnar pages were written by an earlier attempt");
        }
        Ok(PartitionOutput {
            outputs,
            outcomes: std::mem::take(&mut self.outcomes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_storage::{FhirStorage, SearchResult, StorageError, StoredResource};

    struct NoStorage;

    #[async_trait]
    impl FhirStorage for NoStorage {
        async fn read(&self, _: &str, _: &str) -> Result<Option<StoredResource>, StorageError> {
            Ok(None)
        }
        async fn search(&self, _: &str, _: &SearchParams) -> Result<SearchResult, StorageError> {
            Ok(SearchResult::empty())
        }
        async fn create(&self, _: &Value) -> Result<StoredResource, StorageError> {
            Err(StorageError::internal("read-only"))
        }
        async fn update(&self, _: &Value) -> Result<StoredResource, StorageError> {
            Err(StorageError::internal("read-only"))
        }
    }

    fn partition(resource_type: &str, filters: &[&str], members: &[&str]) -> Partition {
        Partition {
            ordinal: 3,
            source_id: "system".into(),
            resource_type: resource_type.into(),
            type_filters: filters.iter().map(|f| f.to_string()).collect(),
            members: members.iter().map(|m| m.to_string()).collect(),
            storage_location: format!("exports/job/{resource_type}_3.ndjson"),
            range: None,
        }
    }

    #[test]
    fn test_params_combine_filter_since_and_compartment() {
        let since = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let source = ExportSource::new(
            Arc::new(NoStorage),
            partition("Observation", &["code=1234-5&_count=5&status=final%20x"], &["a", "b"]),
            100,
            Some(since),
            RetryPolicy::none(),
        )
        .unwrap();
        let params = source.params_for(0, 2);
        assert_eq!(params.count, Some(100));
        assert_eq!(params.offset, Some(200));
        assert_eq!(params.first("code"), Some("1234-5"));
        assert_eq!(params.first("status"), Some("final x"));
        assert_eq!(params.first("_count"), None);
        assert_eq!(params.first("patient"), Some("Patient/a,Patient/b"));
        assert_eq!(params.first("_lastUpdated"), Some("ge2023-11-14T22:13:20Z"));

        let patients = ExportSource::new(
            Arc::new(NoStorage),
            partition("Patient", &[], &["a", "b"]),
            10,
            None,
            RetryPolicy::none(),
        )
        .unwrap();
        let params = patients.params_for(0, 0);
        assert_eq!(params.first("_id"), Some("a,b"));
        assert_eq!(params.first("patient"), None);
    }

    fn patients(ids: std::ops::Range<u32>) -> Vec<Value> {
        ids.map(|i| serde_json::json!({"resourceType": "Patient", "id": format!("p{i:02}")}))
            .collect()
    }

    #[tokio::test]
    async fn test_parts_never_exceed_the_record_threshold_within_a_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(crate::provider::FileProvider::new(dir.path()));
        let settings = ExportSettings {
            max_records_per_part: 2,
            ..ExportSettings::default()
        };
        let partition = partition("Patient", &[], &[]);
        let mut state = CheckpointState::new();
        let mut sink = ExportSink::new(
            provider,
            Arc::new(crate::codec::JsonCodec),
            &partition,
            OutputFormat::Ndjson,
            &settings,
            RetryPolicy::none(),
            10,
            &state,
        )
        .unwrap();

        // Five records: two full parts, one record left over.
        let durable = sink.accept_page(patients(0..5), &mut state).await.unwrap();
        assert!(!durable);
        assert_eq!(state.completed_parts.len(), 2);
        assert_eq!(state.resources_written, 4);

        let durable = sink.accept_page(patients(5..10), &mut state).await.unwrap();
        assert!(durable);
        assert_eq!(state.completed_parts.len(), 5);
        assert_eq!(state.resources_written, 10);

        let output = sink.finish(&mut state).await.unwrap();
        assert_eq!(output.outputs[0].count, 10);
        let written = std::fs::read_to_string(dir.path().join(&partition.storage_location)).unwrap();
        assert_eq!(written.lines().count(), 10);
    }

    #[tokio::test]
    async fn test_remembered_ids_are_not_written_again() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(crate::provider::FileProvider::new(dir.path()));
        let partition = partition("Patient", &[], &[]);
        let mut state = CheckpointState::new();
        let mut sink = ExportSink::new(
            provider,
            Arc::new(crate::codec::JsonCodec),
            &partition,
            OutputFormat::Ndjson,
            &ExportSettings::default(),
            RetryPolicy::none(),
            10,
            &state,
        )
        .unwrap();
        sink.remember_written(&["p01".to_string(), "p03".to_string()]);

        sink.accept_page(patients(0..5), &mut state).await.unwrap();
        sink.finish(&mut state).await.unwrap();
        assert_eq!(state.resources_written, 3);
    }

    #[test]
    fn test_columnar_requires_codec_support() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(crate::provider::FileProvider::new(dir.path()));
        let err = ExportSink::new(
            provider,
            Arc::new(crate::codec::JsonCodec),
            &partition("Patient", &[], &[]),
            OutputFormat::Parquet,
            &ExportSettings::default(),
            RetryPolicy::none(),
            10,
            &CheckpointState::new(),
        )
        .err()
        .unwrap();
        assert!(err.is_job_fatal());
    }
}
