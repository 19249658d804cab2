//! Resource serialization used by the pipelines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BulkError, BulkResult};

/// Output encoding of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Newline-delimited JSON, one resource per line.
    #[default]
    #[serde(alias = "application/fhir+ndjson", alias = "application/ndjson")]
    Ndjson,
    /// Columnar output, one object per page.
    Parquet,
}

impl OutputFormat {
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::Parquet => "parquet",
        }
    }

    pub fn is_line_oriented(&self) -> bool {
        matches!(self, Self::Ndjson)
    }
}

/// Converts resources to and from their stored representation.
pub trait ResourceCodec: Send + Sync {
    fn serialize(&self, resource: &Value) -> BulkResult<Vec<u8>>;

    fn parse(&self, raw: &[u8]) -> BulkResult<Value>;

    fn supports_columnar(&self) -> bool {
        false
    }

    /// Encode a whole page as one columnar object.
    fn encode_columnar(&self, _resource_type: &str, _page: &[Value]) -> BulkResult<Vec<u8>> {
        Err(BulkError::InvalidRequest(
            "columnar output is not supported by this codec".into(),
        ))
    }
}

/// Compact FHIR JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ResourceCodec for JsonCodec {
    fn serialize(&self, resource: &Value) -> BulkResult<Vec<u8>> {
        if !resource.is_object() {
            return Err(BulkError::Record {
                position: 0,
                message: "resource is not a JSON object".into(),
            });
        }
        Ok(serde_json::to_vec(resource)?)
    }

    fn parse(&self, raw: &[u8]) -> BulkResult<Value> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| BulkError::Record {
            position: 0,
            message: format!("invalid JSON: {e}"),
        })?;
        if !value.is_object() {
            return Err(BulkError::Record {
                position: 0,
                message: "line is not a JSON object".into(),
            });
        }
        Ok(value)
    }
}

/// `resourceType` of a parsed resource, if present.
pub fn resource_type_of(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

/// Logical `id` of a resource, if present.
pub fn resource_id_of(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}
