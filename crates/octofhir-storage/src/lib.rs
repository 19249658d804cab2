//! # octofhir-storage
//!
//! Persistence contract consumed by the OctoFHIR bulk data engine.
//!
//! This crate defines the traits and types a storage backend implements so that
//! bulk export can page through query results and bulk import can write
//! batches. It does not contain any implementations.
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_storage::{FhirStorage, SearchParams, StorageError, StoredResource};
//!
//! async fn first_page(
//!     storage: &dyn FhirStorage,
//! ) -> Result<Vec<StoredResource>, StorageError> {
//!     let params = SearchParams::new()
//!         .with_param("_lastUpdated", "ge2024-01-01T00:00:00Z")
//!         .with_count(1000);
//!
//!     let result = storage.search("Observation", &params).await?;
//!     Ok(result.entries)
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::FhirStorage;
pub use types::{SearchParams, SearchResult, SortParam, StoredResource};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage trait object.
pub type DynStorage = std::sync::Arc<dyn FhirStorage>;
