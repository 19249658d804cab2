//! Read-only HTTPS source for imports.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};

use super::{ByteStream, StorageProvider, StorageType, UploadHandle};
use crate::checkpoint::CompletedPart;
use crate::config::HttpsStorageSettings;
use crate::error::{BulkError, BulkResult, StorageFailure};

pub struct HttpsProvider {
    client: Client,
}

impl HttpsProvider {
    pub fn new(settings: &HttpsStorageSettings) -> BulkResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| BulkError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn read_only(op: &'static str, location: &str) -> BulkError {
        BulkError::storage(
            op,
            location,
            StorageFailure::Unsupported,
            "https sources are read-only",
        )
    }
}

/// Map a transport error onto the storage failure taxonomy.
pub(crate) fn request_failure(op: &'static str, location: &str, err: reqwest::Error) -> BulkError {
    let kind = if err.is_timeout() {
        StorageFailure::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        StorageFailure::Unavailable
    } else if let Some(status) = err.status() {
        StorageFailure::from_status(status.as_u16())
    } else {
        StorageFailure::Other
    };
    BulkError::storage(op, location, kind, err)
}

pub(crate) fn status_failure(op: &'static str, location: &str, status: StatusCode) -> BulkError {
    BulkError::storage(
        op,
        location,
        StorageFailure::from_status(status.as_u16()),
        format!("unexpected HTTP status {status}"),
    )
}

/// Turn a response body into a provider byte stream.
pub(crate) fn body_stream(op: &'static str, location: &str, response: reqwest::Response) -> ByteStream {
    let location = location.to_string();
    response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| request_failure(op, &location, e)))
        .boxed()
}

#[async_trait]
impl StorageProvider for HttpsProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Https
    }

    fn supports_ranged_reads(&self) -> bool {
        false
    }

    async fn size(&self, location: &str) -> BulkResult<u64> {
        let response = self
            .client
            .head(location)
            .send()
            .await
            .map_err(|e| request_failure("size", location, e))?;
        if !response.status().is_success() {
            return Err(status_failure("size", location, response.status()));
        }
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                BulkError::storage("size", location, StorageFailure::Other, "missing Content-Length")
            })
    }

    async fn list(&self, prefix: &str) -> BulkResult<Vec<String>> {
        Err(BulkError::storage(
            "list",
            prefix,
            StorageFailure::Unsupported,
            "https sources cannot be listed",
        ))
    }

    async fn open_bytes(&self, location: &str, offset: u64) -> BulkResult<ByteStream> {
        let mut request = self.client.get(location);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_failure("open", location, e))?;
        let status = response.status();
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(BulkError::storage(
                "open",
                location,
                StorageFailure::Unsupported,
                format!("server ignored range request (status {status})"),
            ));
        }
        if !status.is_success() {
            return Err(status_failure("open", location, status));
        }
        Ok(body_stream("read", location, response))
    }

    async fn start_or_continue_upload(
        &self,
        location: &str,
        _upload_id: Option<&str>,
    ) -> BulkResult<UploadHandle> {
        Err(Self::read_only("start_upload", location))
    }

    async fn write_part(
        &self,
        handle: &UploadHandle,
        _part_number: u32,
        _body: Bytes,
    ) -> BulkResult<String> {
        Err(Self::read_only("write_part", &handle.location))
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        _parts: &[CompletedPart],
    ) -> BulkResult<()> {
        Err(Self::read_only("complete_upload", &handle.location))
    }

    async fn abort_upload(&self, _handle: &UploadHandle) -> BulkResult<()> {
        Ok(())
    }

    async fn put_object(&self, location: &str, _body: Bytes) -> BulkResult<()> {
        Err(Self::read_only("put_object", location))
    }

    async fn ensure_destination_exists(&self, location: &str) -> BulkResult<()> {
        Err(Self::read_only("ensure_destination", location))
    }
}
