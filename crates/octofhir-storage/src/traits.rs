//! Storage traits for the FHIR persistence contract.
//!
//! Bulk export reads pages through [`FhirStorage::search`]; bulk import writes
//! through [`FhirStorage::upsert_batch`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{SearchParams, SearchResult, StoredResource};

/// The persistence operations a bulk job needs from a FHIR storage backend.
///
/// Implementations must be thread-safe (`Send + Sync`): one instance is shared
/// by every partition worker of a job.
///
/// # Example
///
/// ```ignore
/// use octofhir_storage::{FhirStorage, StorageError, StoredResource};
///
/// async fn get_group(storage: &dyn FhirStorage, id: &str) -> Result<StoredResource, StorageError> {
///     storage
///         .read("Group", id)
///         .await?
///         .ok_or_else(|| StorageError::not_found("Group", id))
/// }
/// ```
#[async_trait]
pub trait FhirStorage: Send + Sync {
    /// Reads a resource by type and ID.
    ///
    /// Returns `None` if the resource does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing resources.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Searches for resources of a given type.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidSearch` for unsupported search parameters.
    /// Returns an error for infrastructure issues.
    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError>;

    /// Creates a new resource, assigning an ID when the resource has none.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the resource is malformed.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Creates or replaces the resource identified by its `resourceType`/`id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the resource is malformed.
    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Persists a batch of resources.
    ///
    /// Resources with an `id` are upserted, others are created. The default
    /// implementation stops at the first failure; backends that can write a
    /// batch atomically should override it.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    async fn upsert_batch(&self, resources: &[Value]) -> Result<Vec<StoredResource>, StorageError> {
        let mut stored = Vec::with_capacity(resources.len());
        for resource in resources {
            let has_id = resource.get("id").and_then(Value::as_str).is_some();
            let result = if has_id {
                self.update(resource).await?
            } else {
                self.create(resource).await?
            };
            stored.push(result);
        }
        Ok(stored)
    }
}
