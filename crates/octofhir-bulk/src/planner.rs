//! Job requests and partition planning.
//!
//! The planner expands one [`JobRequest`] into immutable [`Partition`]s. A
//! source that cannot be planned is reported in [`PlanOutcome::failures`] and
//! does not prevent the other sources from producing partitions.

use std::collections::BTreeSet;

use octofhir_storage::{FhirStorage, SearchParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::codec::OutputFormat;
use crate::config::BulkDataConfig;
use crate::context::{DEFAULT_TENANT, JobContext};
use crate::error::{BulkError, BulkResult};
use crate::provider::{ByteRange, StorageProvider, StorageType};

/// Which resources an export covers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum ExportScope {
    #[default]
    System,
    /// Compartments of every patient.
    Patient,
    /// Compartments of the members of one Group.
    Group(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub scope: ExportScope,
    /// `_type`. Types named only by a filter are added implicitly.
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// `_typeFilter` entries, `Type?param=value&...`.
    #[serde(default)]
    pub type_filters: Vec<String>,
    /// `_since`.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
}

/// One object to import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportInput {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "url", alias = "location")]
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportRequest {
    pub sources: Vec<ImportInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "operation")]
pub enum BulkOperation {
    Export(ExportRequest),
    Import(ImportRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(flatten)]
    pub operation: BulkOperation,
    pub storage_type: StorageType,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Overrides `export.page_size` / `import.batch_size`.
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Overrides `jobs.max_concurrent_partitions`.
    #[serde(default)]
    pub max_concurrent_partitions: Option<usize>,
}

impl JobRequest {
    pub fn export(storage_type: StorageType, request: ExportRequest) -> Self {
        Self {
            operation: BulkOperation::Export(request),
            storage_type,
            output_format: OutputFormat::default(),
            page_size: None,
            max_concurrent_partitions: None,
        }
    }

    pub fn import(storage_type: StorageType, sources: Vec<ImportInput>) -> Self {
        Self {
            operation: BulkOperation::Import(ImportRequest { sources }),
            storage_type,
            output_format: OutputFormat::default(),
            page_size: None,
            max_concurrent_partitions: None,
        }
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_max_concurrent_partitions(mut self, max: usize) -> Self {
        self.max_concurrent_partitions = Some(max);
        self
    }

    pub fn is_export(&self) -> bool {
        matches!(self.operation, BulkOperation::Export(_))
    }

    pub fn validate(&self) -> BulkResult<()> {
        if self.page_size == Some(0) {
            return Err(BulkError::InvalidRequest("pageSize must be > 0".into()));
        }
        if let Some(max) = self.max_concurrent_partitions {
            if !(1..=64).contains(&max) {
                return Err(BulkError::InvalidRequest(
                    "maxConcurrentPartitions must be within 1..=64".into(),
                ));
            }
        }
        match &self.operation {
            BulkOperation::Export(_) if self.storage_type == StorageType::Https => Err(
                BulkError::InvalidRequest("https storage cannot receive exports".into()),
            ),
            BulkOperation::Import(_) if self.output_format != OutputFormat::Ndjson => Err(
                BulkError::InvalidRequest("imports only read ndjson sources".into()),
            ),
            BulkOperation::Import(req) if req.sources.is_empty() => Err(
                BulkError::InvalidRequest("import request names no sources".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// An independently resumable unit of work. Never mutated after planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub ordinal: u32,
    /// Query slice or source object this partition was planned from.
    pub source_id: String,
    pub resource_type: String,
    /// Export: query strings walked in order. Empty means one unfiltered pass.
    #[serde(default)]
    pub type_filters: Vec<String>,
    /// Export: patient ids of the compartment slice.
    #[serde(default)]
    pub members: Vec<String>,
    /// Export destination or import source.
    pub storage_location: String,
    /// Import: byte range of a matrix segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
}

impl Partition {
    /// Number of query passes an export partition makes.
    pub fn filter_passes(&self) -> usize {
        self.type_filters.len().max(1)
    }

    pub fn descriptor(&self, type_filter_index: usize) -> PartitionDescriptor {
        PartitionDescriptor {
            ordinal: self.ordinal,
            source_location: self.storage_location.clone(),
            resource_type: self.resource_type.clone(),
            type_filter_index,
        }
    }
}

/// Compact identity of a partition, persisted next to its checkpoint state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
    pub ordinal: u32,
    pub source_location: String,
    pub resource_type: String,
    pub type_filter_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningFailure {
    pub source_id: String,
    pub message: String,
}

impl From<&BulkError> for PlanningFailure {
    fn from(err: &BulkError) -> Self {
        match err {
            BulkError::Planning { source_id, message } => Self {
                source_id: source_id.clone(),
                message: message.clone(),
            },
            other => Self {
                source_id: String::new(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub partitions: Vec<Partition>,
    pub failures: Vec<PlanningFailure>,
}

impl PlanOutcome {
    fn fail(&mut self, err: BulkError) {
        tracing::warn!(error = %err, "source could not be planned");
        self.failures.push(PlanningFailure::from(&err));
    }

    /// Partitions, or a job-fatal error if there are none.
    pub fn into_partitions(self) -> BulkResult<(Vec<Partition>, Vec<PlanningFailure>)> {
        if self.partitions.is_empty() {
            let detail = if self.failures.is_empty() {
                "request selected nothing".to_string()
            } else {
                self.failures
                    .iter()
                    .map(|f| format!("{}: {}", f.source_id, f.message))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(BulkError::NothingToDo(detail));
        }
        Ok((self.partitions, self.failures))
    }
}

pub struct PartitionPlanner<'a> {
    config: &'a BulkDataConfig,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(config: &'a BulkDataConfig) -> Self {
        Self { config }
    }

    /// Directory receiving the objects of an export.
    pub fn export_base(&self, ctx: &JobContext) -> String {
        let prefix = self.config.export.output_prefix.trim_matches('/');
        let mut segments: Vec<String> = Vec::new();
        if !prefix.is_empty() {
            segments.push(prefix.to_string());
        }
        if ctx.tenant_id != DEFAULT_TENANT {
            segments.push(ctx.tenant_id.clone());
        }
        segments.push(ctx.job_id.to_string());
        segments.join("/")
    }

    pub async fn plan(
        &self,
        ctx: &JobContext,
        request: &JobRequest,
        storage: &dyn FhirStorage,
        provider: &dyn StorageProvider,
    ) -> BulkResult<PlanOutcome> {
        request.validate()?;
        match &request.operation {
            BulkOperation::Export(export) => {
                self.plan_export(ctx, export, request.output_format, storage).await
            }
            BulkOperation::Import(import) => self.plan_import(import, provider).await,
        }
    }

    pub async fn plan_export(
        &self,
        ctx: &JobContext,
        request: &ExportRequest,
        format: OutputFormat,
        storage: &dyn FhirStorage,
    ) -> BulkResult<PlanOutcome> {
        let mut outcome = PlanOutcome::default();

        let mut types: Vec<String> = Vec::new();
        for ty in &request.resource_types {
            if !types.contains(ty) {
                types.push(ty.clone());
            }
        }
        let explicit: BTreeSet<String> = types.iter().cloned().collect();

        let mut filters: Vec<(String, String)> = Vec::new();
        for raw in &request.type_filters {
            match parse_type_filter(raw) {
                Ok((ty, query)) if explicit.is_empty() || explicit.contains(&ty) => {
                    if !types.contains(&ty) {
                        types.push(ty.clone());
                    }
                    filters.push((ty, query));
                }
                Ok((ty, _)) => outcome.fail(BulkError::planning(
                    raw.as_str(),
                    format!("filter targets '{ty}' which is not exported"),
                )),
                Err(e) => outcome.fail(e),
            }
        }
        if types.is_empty() {
            return Err(BulkError::InvalidRequest(
                "export names no resource types".into(),
            ));
        }

        let slices: Vec<(String, Vec<String>)> = match &request.scope {
            ExportScope::System => vec![("system".to_string(), Vec::new())],
            ExportScope::Patient => {
                let ids = self.all_patient_ids(storage).await?;
                self.member_slices("Patient", ids, &mut outcome)
            }
            ExportScope::Group(group_id) => match self.group_members(storage, group_id).await {
                Ok(ids) => self.member_slices(&format!("Group/{group_id}"), ids, &mut outcome),
                Err(e) => {
                    outcome.fail(e);
                    Vec::new()
                }
            },
        };

        let base = self.export_base(ctx);
        for (slice_id, members) in &slices {
            for ty in &types {
                let ordinal = outcome.partitions.len() as u32;
                let type_filters = filters
                    .iter()
                    .filter(|(t, _)| t == ty)
                    .map(|(_, q)| q.clone())
                    .collect();
                outcome.partitions.push(Partition {
                    ordinal,
                    source_id: format!("{slice_id}:{ty}"),
                    resource_type: ty.clone(),
                    type_filters,
                    members: members.clone(),
                    storage_location: format!(
                        "{base}/{ty}_{ordinal}.{}",
                        format.file_extension()
                    ),
                    range: None,
                });
            }
        }

        tracing::info!(
            job_id = %ctx.job_id,
            partitions = outcome.partitions.len(),
            failures = outcome.failures.len(),
            "export planned"
        );
        Ok(outcome)
    }

    fn member_slices(
        &self,
        source_id: &str,
        ids: Vec<String>,
        outcome: &mut PlanOutcome,
    ) -> Vec<(String, Vec<String>)> {
        if ids.is_empty() {
            outcome.fail(BulkError::planning(source_id, "no patients in scope"));
            return Vec::new();
        }
        ids.chunks(self.config.export.patients_per_partition.max(1))
            .enumerate()
            .map(|(i, chunk)| (format!("{source_id}#{i}"), chunk.to_vec()))
            .collect()
    }

    async fn all_patient_ids(&self, storage: &dyn FhirStorage) -> BulkResult<Vec<String>> {
        let page = self.config.export.page_size.max(1) as u32;
        let mut ids = Vec::new();
        let mut offset = 0u32;
        loop {
            let params = SearchParams::new()
                .with_count(page)
                .with_offset(offset)
                .with_sort("_id", false);
            let result = storage.search("Patient", &params).await?;
            let fetched = result.entries.len() as u32;
            ids.extend(result.entries.into_iter().map(|r| r.id));
            if !result.has_more || fetched == 0 {
                break;
            }
            offset += fetched;
        }
        Ok(ids)
    }

    async fn group_members(&self, storage: &dyn FhirStorage, group_id: &str) -> BulkResult<Vec<String>> {
        let source_id = format!("Group/{group_id}");
        let group = storage
            .read("Group", group_id)
            .await?
            .ok_or_else(|| BulkError::planning(&source_id, "group does not exist"))?;
        let members = group
            .resource
            .get("member")
            .and_then(Value::as_array)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| !m.get("inactive").and_then(Value::as_bool).unwrap_or(false))
                    .filter_map(|m| m.pointer("/entity/reference").and_then(Value::as_str))
                    .filter_map(|r| r.strip_prefix("Patient/"))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let mut seen = BTreeSet::new();
        Ok(members.into_iter().filter(|id| seen.insert(id.clone())).collect())
    }

    pub async fn plan_import(
        &self,
        request: &ImportRequest,
        provider: &dyn StorageProvider,
    ) -> BulkResult<PlanOutcome> {
        let mut outcome = PlanOutcome::default();
        let settings = &self.config.import;
        for source in &request.sources {
            if source.resource_type.is_empty() {
                outcome.fail(BulkError::planning(&source.location, "source names no resource type"));
                continue;
            }
            let size = match provider.size(&source.location).await {
                Ok(size) => size,
                Err(e) => {
                    outcome.fail(BulkError::planning(&source.location, e.to_string()));
                    continue;
                }
            };
            let ranges = if settings.matrix_splitting
                && provider.supports_ranged_reads()
                && size > settings.segment_bytes
            {
                ByteRange::split(size, settings.segment_bytes)
                    .into_iter()
                    .map(Some)
                    .collect()
            } else {
                vec![None]
            };
            let segments = ranges.len();
            for range in ranges {
                let ordinal = outcome.partitions.len() as u32;
                outcome.partitions.push(Partition {
                    ordinal,
                    source_id: source.location.clone(),
                    resource_type: source.resource_type.clone(),
                    type_filters: Vec::new(),
                    members: Vec::new(),
                    storage_location: source.location.clone(),
                    range,
                });
            }
            tracing::debug!(location = %source.location, size, segments, "import source planned");
        }
        Ok(outcome)
    }
}

/// Split `Type?query` into its parts.
pub fn parse_type_filter(raw: &str) -> BulkResult<(String, String)> {
    let (ty, query) = raw
        .split_once('?')
        .ok_or_else(|| BulkError::planning(raw, "type filter must look like 'Type?param=value'"))?;
    if ty.is_empty() || !ty.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BulkError::planning(raw, "type filter has an invalid resource type"));
    }
    if query.is_empty() {
        return Err(BulkError::planning(raw, "type filter has no query"));
    }
    Ok((ty.to_string(), query.to_string()))
}
