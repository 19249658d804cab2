//! Per-partition resumable progress.
//!
//! A [`CheckpointState`] is a plain value: the engine mutates it while a
//! partition runs and hands snapshots to whoever persists job state. Restoring
//! a partition from a snapshot continues the same multi-part upload at the
//! next page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One acknowledged part of a multi-part upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    /// Provider-issued identifier (ETag, block id, content digest).
    pub part_id: String,
}

/// Counters for one resource type within a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSummary {
    pub resources: u64,
    pub bytes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// Next page to read. Never decreases within one attempt.
    pub page_number: u64,
    /// Last page of the current source, when the source reported a total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_page_number: Option<u64>,
    /// Page at which the current type filter started.
    #[serde(default)]
    pub filter_start_page: u64,
    /// Part number the next flush will use (parts start at 1).
    pub current_upload_part_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub completed_parts: Vec<CompletedPart>,
    /// Records durably written (flushed parts or persisted batches).
    pub resources_written: u64,
    pub bytes_written: u64,
    /// Records skipped because they failed to serialize or parse.
    #[serde(default)]
    pub record_failures: u64,
    #[serde(default)]
    pub current_type_filter_index: usize,
    #[serde(default)]
    pub resource_type_summary: BTreeMap<String, TypeSummary>,
    /// Set once the partition's output is final.
    #[serde(default)]
    pub complete: bool,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self {
            current_upload_part_number: 1,
            ..Self::default()
        }
    }

    /// Advance to the next page.
    pub fn advance_page(&mut self) {
        self.page_number += 1;
    }

    /// Move on to the next type filter; paging restarts relative to here.
    pub fn advance_type_filter(&mut self) {
        self.current_type_filter_index += 1;
        self.filter_start_page = self.page_number;
        self.last_page_number = None;
    }

    /// Page index relative to the start of the current type filter.
    pub fn page_within_filter(&self) -> u64 {
        self.page_number.saturating_sub(self.filter_start_page)
    }

    /// Record an acknowledged part and move the part counter forward.
    pub fn record_part(&mut self, part: CompletedPart) {
        self.current_upload_part_number = part.part_number + 1;
        self.completed_parts.push(part);
    }

    /// Account for records that became durable.
    pub fn record_written(&mut self, resource_type: &str, resources: u64, bytes: u64) {
        self.resources_written += resources;
        self.bytes_written += bytes;
        let summary = self
            .resource_type_summary
            .entry(resource_type.to_string())
            .or_default();
        summary.resources += resources;
        summary.bytes += bytes;
    }

    pub fn record_failure(&mut self, resource_type: &str) {
        self.record_failures += 1;
        self.resource_type_summary
            .entry(resource_type.to_string())
            .or_default()
            .failures += 1;
    }

    /// Forget the in-flight upload, e.g. after it was completed or aborted.
    pub fn clear_upload(&mut self) {
        self.upload_id = None;
        self.completed_parts.clear();
        self.current_upload_part_number = 1;
    }

    /// Compact `Type[resources,bytes,failures]` rendering for status output.
    pub fn summary_string(&self) -> String {
        self.resource_type_summary
            .iter()
            .map(|(ty, s)| format!("{ty}[{},{},{}]", s.resources, s.bytes, s.failures))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_at_part_one() {
        let state = CheckpointState::new();
        assert_eq!(state.page_number, 0);
        assert_eq!(state.current_upload_part_number, 1);
        assert!(state.upload_id.is_none());
    }

    #[test]
    fn test_filter_paging_keeps_page_number_monotonic() {
        let mut state = CheckpointState::new();
        state.advance_page();
        state.advance_page();
        state.advance_type_filter();
        assert_eq!(state.page_number, 2);
        assert_eq!(state.page_within_filter(), 0);
        state.advance_page();
        assert_eq!(state.page_within_filter(), 1);
        assert_eq!(state.current_type_filter_index, 1);
    }

    #[test]
    fn test_serde_uses_camel_case_and_round_trips() {
        let mut state = CheckpointState::new();
        state.upload_id = Some("u-1".into());
        state.record_part(CompletedPart {
            part_number: 1,
            part_id: "etag-1".into(),
        });
        state.record_written("Patient", 10, 2048);
        state.record_failure("Patient");

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["currentUploadPartNumber"], 2);
        assert_eq!(json["completedParts"][0]["partId"], "etag-1");
        assert_eq!(json["resourceTypeSummary"]["Patient"]["resources"], 10);

        let back: CheckpointState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.summary_string(), "Patient[10,2048,1]");
    }
}
