//! Chunk buffering and multi-part upload coordination.
//!
//! A [`ChunkBuffer`] belongs to exactly one partition. Records are appended
//! CRLF-terminated; once a byte or record threshold is reached the buffer is
//! written as the next numbered part of the partition's upload. The buffer is
//! only cleared after the provider acknowledged the part, so a failed flush
//! can be retried with the same content.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::checkpoint::{CheckpointState, CompletedPart};
use crate::error::{BulkError, BulkResult};
use crate::pipeline::retry::RetryPolicy;
use crate::provider::{StorageProvider, UploadHandle};

pub const RECORD_SEPARATOR: &[u8] = b"\r\n";

/// A part that was written and acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    pub part_number: u32,
    pub part_id: String,
    pub upload_id: String,
    pub resources: u64,
    pub bytes: u64,
}

/// Result of completing an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub location: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

/// Remembers recently written logical ids, evicting the oldest first.
#[derive(Debug)]
pub struct DedupGuard {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` if `id` was already seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct ChunkBuffer {
    provider: Arc<dyn StorageProvider>,
    location: String,
    buf: Vec<u8>,
    buffered_records: u64,
    /// Upload id restored from a checkpoint, opened lazily.
    pending_upload_id: Option<String>,
    handle: Option<UploadHandle>,
    parts: Vec<CompletedPart>,
    next_part_number: u32,
    /// Smallest part the provider accepts before the last one.
    min_part_bytes: usize,
    dedup: DedupGuard,
    retry: RetryPolicy,
}

impl ChunkBuffer {
    pub fn new(provider: Arc<dyn StorageProvider>, location: impl Into<String>) -> Self {
        Self {
            min_part_bytes: provider.min_part_bytes(),
            provider,
            location: location.into(),
            buf: Vec::new(),
            buffered_records: 0,
            pending_upload_id: None,
            handle: None,
            parts: Vec::new(),
            next_part_number: 1,
            dedup: DedupGuard::new(100_000),
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup = DedupGuard::new(capacity);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Continue the upload recorded in `state`.
    pub fn restore(mut self, state: &CheckpointState) -> Self {
        self.pending_upload_id = state.upload_id.clone();
        self.parts = state.completed_parts.clone();
        self.next_part_number = state.current_upload_part_number.max(1);
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.handle
            .as_ref()
            .map(|h| h.upload_id.as_str())
            .or(self.pending_upload_id.as_deref())
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered_records(&self) -> u64 {
        self.buffered_records
    }

    pub fn is_empty(&self) -> bool {
        self.buffered_records == 0
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    /// Buffer one serialized record.
    pub fn append(&mut self, record: &[u8]) {
        self.buf.extend_from_slice(record);
        self.buf.extend_from_slice(RECORD_SEPARATOR);
        self.buffered_records += 1;
    }

    /// Mark `id` as already written, e.g. by an earlier attempt.
    pub fn remember(&mut self, id: &str) {
        self.dedup.insert(id);
    }

    /// Buffer `record` unless `id` was already written by this partition.
    pub fn append_unique(&mut self, id: &str, record: &[u8]) -> bool {
        if !self.dedup.insert(id) {
            tracing::trace!(id, location = %self.location, "skipping duplicate record");
            return false;
        }
        self.append(record);
        true
    }

    /// True once either threshold is reached and the buffer is large enough
    /// to be a non-final part.
    pub fn should_flush(&self, threshold_bytes: usize, threshold_records: usize) -> bool {
        let bytes = self.buf.len();
        !self.is_empty()
            && bytes >= self.min_part_bytes
            && (bytes >= threshold_bytes || self.buffered_records >= threshold_records as u64)
    }

    /// Whether [`flush`](Self::flush) would leave a part that can be followed
    /// by more parts.
    pub fn can_flush_part(&self) -> bool {
        self.is_empty() || self.buf.len() >= self.min_part_bytes
    }

    pub async fn flush_if_needed(
        &mut self,
        threshold_bytes: usize,
        threshold_records: usize,
    ) -> BulkResult<Option<FlushResult>> {
        if !self.should_flush(threshold_bytes, threshold_records) {
            return Ok(None);
        }
        self.flush().await
    }

    async fn ensure_upload(&mut self) -> BulkResult<UploadHandle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let provider = self.provider.clone();
        let location = self.location.clone();
        let resume = self.pending_upload_id.clone();
        let handle = self
            .retry
            .run("start_upload", || {
                provider.start_or_continue_upload(&location, resume.as_deref())
            })
            .await?;
        tracing::debug!(location = %self.location, upload_id = %handle.upload_id, "upload open");
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Write the buffered records as the next part.
    pub async fn flush(&mut self) -> BulkResult<Option<FlushResult>> {
        if self.is_empty() {
            return Ok(None);
        }
        let handle = self.ensure_upload().await?;
        let part_number = self.next_part_number;
        let body = Bytes::copy_from_slice(&self.buf);
        let bytes = body.len() as u64;
        let provider = self.provider.clone();
        let part_id = self
            .retry
            .run("write_part", || {
                provider.write_part(&handle, part_number, body.clone())
            })
            .await?;

        let resources = self.buffered_records;
        self.buf.clear();
        self.buffered_records = 0;
        self.parts.push(CompletedPart {
            part_number,
            part_id: part_id.clone(),
        });
        self.next_part_number = part_number + 1;
        tracing::debug!(
            location = %self.location,
            part_number,
            resources,
            bytes,
            "part uploaded"
        );
        Ok(Some(FlushResult {
            part_number,
            part_id,
            upload_id: handle.upload_id,
            resources,
            bytes,
        }))
    }

    /// Flush the remainder and complete the upload.
    ///
    /// Returns `None` when nothing was ever written, in which case no object
    /// is created.
    pub async fn finalize(mut self) -> BulkResult<(Option<UploadSummary>, Option<FlushResult>)> {
        let last = self.flush().await?;
        if self.parts.is_empty() {
            return Ok((None, last));
        }
        let handle = self.ensure_upload().await?;

        let contiguous = self
            .parts
            .iter()
            .enumerate()
            .all(|(i, p)| p.part_number as usize == i + 1 && !p.part_id.is_empty());
        if !contiguous {
            let numbers: Vec<u32> = self.parts.iter().map(|p| p.part_number).collect();
            self.abort_quietly(&handle).await;
            return Err(BulkError::integrity(
                &self.location,
                format!("parts are missing or out of order: {numbers:?}"),
            ));
        }

        let provider = self.provider.clone();
        let parts = self.parts.clone();
        let completed = self
            .retry
            .run("complete_upload", || provider.complete_upload(&handle, &parts))
            .await;
        if let Err(e) = completed {
            if matches!(e, BulkError::UploadIntegrity { .. }) {
                self.abort_quietly(&handle).await;
            }
            return Err(e);
        }
        tracing::info!(
            location = %self.location,
            parts = self.parts.len(),
            "upload completed"
        );
        Ok((
            Some(UploadSummary {
                location: self.location,
                upload_id: handle.upload_id,
                parts: self.parts,
            }),
            last,
        ))
    }

    async fn abort_quietly(&self, handle: &UploadHandle) {
        if let Err(e) = self.provider.abort_upload(handle).await {
            tracing::warn!(location = %self.location, error = %e, "abort of upload failed");
        }
    }
}

/// Apply a flush to a partition's checkpoint state.
pub fn record_flush(state: &mut CheckpointState, resource_type: &str, flush: &FlushResult) {
    state.upload_id = Some(flush.upload_id.clone());
    state.record_part(CompletedPart {
        part_number: flush.part_number,
        part_id: flush.part_id.clone(),
    });
    state.record_written(resource_type, flush.resources, flush.bytes);
}
