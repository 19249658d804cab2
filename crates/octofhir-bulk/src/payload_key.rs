//! Object naming for storage-backed resource payloads.
//!
//! Payload objects live at `<resourceTypeId>/<logicalId>/<version>[/<key>]`.
//! A `.` in the logical id is written as `#` so that tools treating `.` as an
//! extension separator see the same segment layout.

use std::fmt;
use std::str::FromStr;

use crate::error::{BulkError, BulkResult};

const ESCAPED_FROM: char = '.';
const ESCAPED_TO: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKey {
    pub resource_type_id: i32,
    pub logical_id: String,
    pub version: i32,
    /// Distinguishes several payloads of the same resource version.
    pub key: Option<String>,
}

impl PayloadKey {
    pub fn new(resource_type_id: i32, logical_id: impl Into<String>, version: i32) -> BulkResult<Self> {
        let logical_id = logical_id.into();
        validate_logical_id(&logical_id)?;
        Ok(Self {
            resource_type_id,
            logical_id,
            version,
            key: None,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> BulkResult<Self> {
        let key = key.into();
        if key.is_empty() || key.contains('/') {
            return Err(invalid(&key, "key must be a single non-empty segment"));
        }
        self.key = Some(key);
        Ok(self)
    }

    /// Object path for this key.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse an object path back into its key.
    pub fn decode(path: &str) -> BulkResult<Self> {
        path.parse()
    }
}

fn invalid(path: &str, message: impl Into<String>) -> BulkError {
    BulkError::InvalidObjectPath {
        path: path.to_string(),
        message: message.into(),
    }
}

fn validate_logical_id(id: &str) -> BulkResult<()> {
    if id.is_empty() {
        return Err(invalid(id, "logical id must not be empty"));
    }
    if id.contains('/') || id.contains(ESCAPED_TO) {
        return Err(invalid(
            id,
            format!("logical id must not contain '/' or '{ESCAPED_TO}'"),
        ));
    }
    Ok(())
}

impl fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped = self.logical_id.replace(ESCAPED_FROM, &ESCAPED_TO.to_string());
        write!(f, "{}/{}/{}", self.resource_type_id, escaped, self.version)?;
        if let Some(key) = &self.key {
            write!(f, "/{key}")?;
        }
        Ok(())
    }
}

impl FromStr for PayloadKey {
    type Err = BulkError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = path.split('/').collect();
        if !(3..=4).contains(&segments.len()) {
            return Err(invalid(
                path,
                format!("expected 3 or 4 segments, found {}", segments.len()),
            ));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid(path, "empty path segment"));
        }
        let resource_type_id = segments[0]
            .parse::<i32>()
            .map_err(|e| invalid(path, format!("bad resource type id: {e}")))?;
        if segments[1].contains(ESCAPED_FROM) {
            return Err(invalid(path, "logical id segment is not escaped"));
        }
        let logical_id = segments[1].replace(ESCAPED_TO, &ESCAPED_FROM.to_string());
        let version = segments[2]
            .parse::<i32>()
            .map_err(|e| invalid(path, format!("bad version: {e}")))?;
        Ok(Self {
            resource_type_id,
            logical_id,
            version,
            key: segments.get(3).map(|k| k.to_string()),
        })
    }
}
