#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use octofhir_bulk::BulkDataConfig;
use octofhir_storage::{FhirStorage, SearchParams, SearchResult, StorageError, StoredResource};
use serde_json::Value;

/// In-memory persistence with failure injection.
#[derive(Default)]
pub struct MemoryStorage {
    resources: Mutex<BTreeMap<(String, String), StoredResource>>,
    next_id: AtomicU64,
    /// Resources handed to `upsert_batch`, duplicates included.
    pub upserted: AtomicU64,
    /// Upcoming `upsert_batch` calls that fail with a throttling error.
    pub throttle_upserts: AtomicU32,
    /// Upcoming `search` calls that fail with a timeout.
    pub timeout_searches: AtomicU32,
    /// Types whose searches always fail permanently.
    failing_types: Mutex<HashSet<String>>,
    /// Ids the backend refuses to store.
    rejected_ids: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, resources: impl IntoIterator<Item = Value>) {
        let mut map = self.resources.lock().unwrap();
        for resource in resources {
            let ty = resource["resourceType"].as_str().unwrap().to_string();
            let id = resource["id"].as_str().unwrap().to_string();
            map.insert((ty.clone(), id.clone()), StoredResource::new(id, "1", ty, resource));
        }
    }

    pub fn fail_searches_for(&self, resource_type: &str) {
        self.failing_types.lock().unwrap().insert(resource_type.to_string());
    }

    pub fn reject_id(&self, id: &str) {
        self.rejected_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn count(&self, resource_type: &str) -> usize {
        self.resources
            .lock()
            .unwrap()
            .keys()
            .filter(|(ty, _)| ty == resource_type)
            .count()
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.resources
            .lock()
            .unwrap()
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|r| r.resource.clone())
    }

    fn matches(resource: &StoredResource, params: &SearchParams) -> bool {
        params.parameters.iter().all(|(key, values)| {
            values.iter().all(|value| match key.as_str() {
                "_id" => value.split(',').any(|id| id == resource.id),
                "patient" => {
                    let subject = resource.resource.pointer("/subject/reference").and_then(Value::as_str);
                    value.split(',').any(|r| Some(r) == subject)
                }
                "_lastUpdated" => true,
                field => match resource.resource.get(field) {
                    Some(Value::String(s)) => s == value,
                    Some(other) => other.to_string() == *value,
                    None => false,
                },
            })
        })
    }

    fn store(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let ty = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_resource("missing resourceType"))?
            .to_string();
        let id = match resource.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => format!("gen-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        };
        if self.rejected_ids.lock().unwrap().contains(&id) {
            return Err(StorageError::invalid_resource(format!("{ty}/{id} violates a constraint")));
        }
        let mut body = resource.clone();
        body["id"] = Value::String(id.clone());
        let stored = StoredResource::new(id.clone(), "1", ty.clone(), body);
        self.resources.lock().unwrap().insert((ty, id), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl FhirStorage for MemoryStorage {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<StoredResource>, StorageError> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned())
    }

    async fn search(&self, resource_type: &str, params: &SearchParams) -> Result<SearchResult, StorageError> {
        if self.failing_types.lock().unwrap().contains(resource_type) {
            return Err(StorageError::invalid_search(format!("{resource_type} is not searchable")));
        }
        if self
            .timeout_searches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::timeout("search timed out"));
        }
        let matching: Vec<StoredResource> = self
            .resources
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.resource_type == resource_type && Self::matches(r, params))
            .cloned()
            .collect();
        let offset = params.offset.unwrap_or(0) as usize;
        let count = params.count.map(|c| c as usize).unwrap_or(matching.len());
        let entries: Vec<StoredResource> = matching.iter().skip(offset).take(count).cloned().collect();
        let has_more = offset + entries.len() < matching.len();
        Ok(SearchResult::with_entries(entries)
            .with_total(matching.len() as u32)
            .with_has_more(has_more))
    }

    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.store(resource)
    }

    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.store(resource)
    }

    async fn upsert_batch(&self, resources: &[Value]) -> Result<Vec<StoredResource>, StorageError> {
        if self
            .throttle_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::throttled("too many writes"));
        }
        let rejected = self.rejected_ids.lock().unwrap().clone();
        if let Some(id) = resources
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str))
            .find(|id| rejected.contains(*id))
        {
            return Err(StorageError::invalid_resource(format!("batch contains rejected id {id}")));
        }
        self.upserted.fetch_add(resources.len() as u64, Ordering::SeqCst);
        resources.iter().map(|r| self.store(r)).collect()
    }
}

pub fn patient(id: &str, gender: &str) -> Value {
    serde_json::json!({"resourceType": "Patient", "id": id, "gender": gender})
}

pub fn observation(id: &str, patient: &str, status: &str, code: &str) -> Value {
    serde_json::json!({
        "resourceType": "Observation",
        "id": id,
        "status": status,
        "code": code,
        "subject": {"reference": format!("Patient/{patient}")}
    })
}

/// Config rooted at `dir` with small thresholds and instant retries.
pub fn test_config(dir: &Path) -> BulkDataConfig {
    let mut config = BulkDataConfig::default();
    config.storage.file.base_dir = dir.to_string_lossy().into_owned();
    config.export.page_size = 5;
    config.export.max_records_per_part = 5;
    config.import.batch_size = 10;
    config.jobs.retry_backoff_ms = 0;
    config.jobs.max_backoff_ms = 0;
    config
}

/// Non-empty lines of an output object, with their terminators.
pub fn read_lines(path: &Path) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    text.split_inclusive('\n').map(str::to_string).collect()
}
