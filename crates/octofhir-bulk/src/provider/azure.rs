//! Azure Blob Storage over the REST API, authenticated with a SAS token.
//!
//! Multi-part uploads map onto block blobs: every part is staged with
//! `Put Block` and the upload completes with `Put Block List`. Uncommitted
//! blocks expire on the service side, so aborting is a no-op.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use super::https::{body_stream, request_failure, status_failure};
use super::{ByteStream, StorageProvider, StorageType, UploadHandle};
use crate::checkpoint::CompletedPart;
use crate::config::{AzureStorageSettings, HttpsStorageSettings};
use crate::error::{BulkError, BulkResult, StorageFailure};

const API_VERSION: &str = "2021-08-06";

pub struct AzureBlobProvider {
    client: Client,
    service_url: String,
    container: String,
    sas_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
}

impl AzureBlobProvider {
    pub fn new(settings: &AzureStorageSettings, http: &HttpsStorageSettings) -> BulkResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(http.timeout_ms))
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| BulkError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            service_url: settings.service_url(),
            container: settings.container.clone(),
            sas_token: settings
                .sas_token
                .as_ref()
                .map(|t| t.trim_start_matches('?').to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> BulkResult<Url> {
        let raw = format!("{}/{}", self.service_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|e| BulkError::InvalidObjectPath {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        if let Some(sas) = &self.sas_token {
            let combined = match url.query() {
                Some(q) => format!("{q}&{sas}"),
                None => sas.clone(),
            };
            url.set_query(Some(&combined));
        }
        Ok(url)
    }

    fn blob_url(&self, location: &str, query: &[(&str, &str)]) -> BulkResult<Url> {
        self.url(
            &format!("{}/{}", self.container, location.trim_start_matches('/')),
            query,
        )
    }

    fn block_id(upload_id: &str, part_number: u32) -> String {
        // Every block id of a blob must have the same length.
        BASE64.encode(format!("{upload_id}-{part_number:06}"))
    }

    async fn check(
        op: &'static str,
        location: &str,
        response: reqwest::Response,
    ) -> BulkResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = response
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match code.as_deref() {
            Some("InvalidBlockList" | "InvalidBlockId") => Err(BulkError::integrity(
                location,
                format!("block list rejected with status {status}"),
            )),
            Some("ServerBusy") => Err(BulkError::storage(
                op,
                location,
                StorageFailure::Throttled,
                "server busy",
            )),
            _ => Err(status_failure(op, location, status)),
        }
    }
}

#[async_trait]
impl StorageProvider for AzureBlobProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Azure
    }

    async fn size(&self, location: &str) -> BulkResult<u64> {
        let response = self
            .client
            .head(self.blob_url(location, &[])?)
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(|e| request_failure("size", location, e))?;
        let response = Self::check("size", location, response).await?;
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
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut query = vec![
                ("restype", "container"),
                ("comp", "list"),
                ("prefix", prefix.trim_start_matches('/')),
            ];
            if let Some(m) = marker.as_deref() {
                query.push(("marker", m));
            }
            let url = self.url(&self.container, &query)?;
            let response = self
                .client
                .get(url)
                .header("x-ms-version", API_VERSION)
                .send()
                .await
                .map_err(|e| request_failure("list", prefix, e))?;
            let body = Self::check("list", prefix, response)
                .await?
                .text()
                .await
                .map_err(|e| request_failure("list", prefix, e))?;
            let page: EnumerationResults = quick_xml::de::from_str(&body).map_err(|e| {
                BulkError::storage("list", prefix, StorageFailure::Other, format!("bad listing: {e}"))
            })?;
            names.extend(page.blobs.items.into_iter().map(|b| b.name));
            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        names.sort();
        Ok(names)
    }

    async fn open_bytes(&self, location: &str, offset: u64) -> BulkResult<ByteStream> {
        let mut request = self
            .client
            .get(self.blob_url(location, &[])?)
            .header("x-ms-version", API_VERSION);
        if offset > 0 {
            request = request.header("x-ms-range", format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_failure("open", location, e))?;
        let response = Self::check("open", location, response).await?;
        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(BulkError::storage(
                "open",
                location,
                StorageFailure::Unsupported,
                "range request was not honoured",
            ));
        }
        Ok(body_stream("read", location, response))
    }

    async fn start_or_continue_upload(
        &self,
        location: &str,
        upload_id: Option<&str>,
    ) -> BulkResult<UploadHandle> {
        Ok(UploadHandle {
            location: location.to_string(),
            upload_id: upload_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        })
    }

    async fn write_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        body: Bytes,
    ) -> BulkResult<String> {
        let block_id = Self::block_id(&handle.upload_id, part_number);
        let url = self.blob_url(&handle.location, &[("comp", "block"), ("blockid", &block_id)])?;
        let response = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await
            .map_err(|e| request_failure("write_part", &handle.location, e))?;
        Self::check("write_part", &handle.location, response).await?;
        Ok(block_id)
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[CompletedPart],
    ) -> BulkResult<()> {
        let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for part in parts {
            xml.push_str("<Latest>");
            xml.push_str(&part.part_id);
            xml.push_str("</Latest>");
        }
        xml.push_str("</BlockList>");

        let url = self.blob_url(&handle.location, &[("comp", "blocklist")])?;
        let response = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-content-type", "application/fhir+ndjson")
            .body(xml)
            .send()
            .await
            .map_err(|e| request_failure("complete_upload", &handle.location, e))?;
        Self::check("complete_upload", &handle.location, response).await?;
        Ok(())
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> BulkResult<()> {
        tracing::debug!(
            location = %handle.location,
            upload_id = %handle.upload_id,
            "leaving uncommitted blocks to expire"
        );
        Ok(())
    }

    async fn put_object(&self, location: &str, body: Bytes) -> BulkResult<()> {
        let response = self
            .client
            .put(self.blob_url(location, &[])?)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await
            .map_err(|e| request_failure("put_object", location, e))?;
        Self::check("put_object", location, response).await?;
        Ok(())
    }

    async fn ensure_destination_exists(&self, location: &str) -> BulkResult<()> {
        let url = self.url(&self.container, &[("restype", "container")])?;
        let response = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(|e| request_failure("ensure_destination", location, e))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check("ensure_destination", location, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(sas: Option<&str>) -> AzureBlobProvider {
        AzureBlobProvider::new(
            &AzureStorageSettings {
                account: "acct".into(),
                container: "bulk".into(),
                sas_token: sas.map(str::to_string),
                endpoint: None,
            },
            &HttpsStorageSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_block_ids_have_constant_length() {
        let a = AzureBlobProvider::block_id("0123456789abcdef0123456789abcdef", 1);
        let b = AzureBlobProvider::block_id("0123456789abcdef0123456789abcdef", 999_999);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_blob_url_appends_sas_after_query() {
        let p = provider(Some("?sv=2021&sig=abc%3D"));
        let url = p
            .blob_url("exports/job/Patient_1.ndjson", &[("comp", "block")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.blob.core.windows.net/bulk/exports/job/Patient_1.ndjson?comp=block&sv=2021&sig=abc%3D"
        );

        let plain = provider(None).blob_url("a.ndjson", &[]).unwrap();
        assert_eq!(plain.query(), None);
    }

    #[test]
    fn test_listing_xml_parses() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="bulk">
  <Prefix>in/</Prefix>
  <Blobs>
    <Blob><Name>in/Patient.ndjson</Name><Properties><Content-Length>10</Content-Length></Properties></Blob>
    <Blob><Name>in/Observation.ndjson</Name><Properties><Content-Length>20</Content-Length></Properties></Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;
        let page: EnumerationResults = quick_xml::de::from_str(xml).unwrap();
        let names: Vec<_> = page.blobs.items.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["in/Patient.ndjson", "in/Observation.ndjson"]);
        assert!(page.next_marker.filter(|m| !m.is_empty()).is_none());
    }
}
