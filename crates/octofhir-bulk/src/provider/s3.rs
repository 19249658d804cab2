//! S3-compatible object storage (AWS S3, MinIO, IBM COS).

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart as S3CompletedPart,
    CreateBucketConfiguration,
};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;

use super::{ByteStream, StorageProvider, StorageType, UploadHandle};
use crate::checkpoint::CompletedPart;
use crate::config::{S3StorageSettings, S3_MIN_PART_BYTES};
use crate::error::{BulkError, BulkResult, StorageFailure};

pub struct S3Provider {
    client: Client,
    bucket: String,
    region: String,
}

impl S3Provider {
    pub fn new(settings: &S3StorageSettings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "octofhir-bulk",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            // Retries are owned by the engine's retry policy.
            .retry_config(RetryConfig::disabled())
            .force_path_style(settings.path_style);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn key(location: &str) -> &str {
    location.trim_start_matches('/')
}

fn sdk_failure<E>(op: &'static str, location: &str, err: SdkError<E, HttpResponse>) -> BulkError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) => StorageFailure::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => StorageFailure::Timeout,
        SdkError::DispatchFailure(_) => StorageFailure::Unavailable,
        _ => match err.code() {
            Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
                StorageFailure::Throttled
            }
            Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound") => {
                StorageFailure::NotFound
            }
            Some("InvalidPart" | "InvalidPartOrder" | "EntityTooSmall") => {
                StorageFailure::Integrity
            }
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                StorageFailure::Denied
            }
            _ => err
                .raw_response()
                .map(|r| StorageFailure::from_status(r.status().as_u16()))
                .unwrap_or(StorageFailure::Other),
        },
    };
    BulkError::storage(op, location, kind, DisplayErrorContext(&err))
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    fn min_part_bytes(&self) -> usize {
        S3_MIN_PART_BYTES
    }

    async fn size(&self, location: &str) -> BulkResult<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key(location))
            .send()
            .await
            .map_err(|e| sdk_failure("size", location, e))?;
        Ok(head.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn list(&self, prefix: &str) -> BulkResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(key(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_failure("list", prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn open_bytes(&self, location: &str, offset: u64) -> BulkResult<ByteStream> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key(location));
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let output = request
            .send()
            .await
            .map_err(|e| sdk_failure("open", location, e))?;

        let location = location.to_string();
        let body = stream::unfold(Some(output.body), move |body: Option<S3Body>| {
            let location = location.clone();
            async move {
                let mut body = body?;
                match body.try_next().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                    Ok(None) => None,
                    Err(e) => Some((
                        Err(BulkError::storage(
                            "read",
                            location,
                            StorageFailure::Unavailable,
                            e,
                        )),
                        None,
                    )),
                }
            }
        });
        Ok(body.boxed())
    }

    async fn start_or_continue_upload(
        &self,
        location: &str,
        upload_id: Option<&str>,
    ) -> BulkResult<UploadHandle> {
        if let Some(upload_id) = upload_id {
            // An upload that expired or was aborted cannot be continued.
            self.client
                .list_parts()
                .bucket(&self.bucket)
                .key(key(location))
                .upload_id(upload_id)
                .max_parts(1)
                .send()
                .await
                .map_err(|e| match sdk_failure("continue_upload", location, e) {
                    BulkError::Storage {
                        kind: StorageFailure::NotFound,
                        message,
                        ..
                    } => BulkError::integrity(location, message),
                    other => other,
                })?;
            return Ok(UploadHandle {
                location: location.to_string(),
                upload_id: upload_id.to_string(),
            });
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key(location))
            .content_type("application/fhir+ndjson")
            .send()
            .await
            .map_err(|e| sdk_failure("start_upload", location, e))?;
        let upload_id = created.upload_id().ok_or_else(|| {
            BulkError::storage(
                "start_upload",
                location,
                StorageFailure::Other,
                "response carried no upload id",
            )
        })?;
        Ok(UploadHandle {
            location: location.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    async fn write_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        body: Bytes,
    ) -> BulkResult<String> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key(&handle.location))
            .upload_id(&handle.upload_id)
            .part_number(part_number as i32)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| sdk_failure("write_part", &handle.location, e))?;
        uploaded
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BulkError::integrity(&handle.location, format!("part {part_number} returned no ETag")))
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[CompletedPart],
    ) -> BulkResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number as i32)
                            .e_tag(&p.part_id)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key(&handle.location))
            .upload_id(&handle.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| match sdk_failure("complete_upload", &handle.location, e) {
                BulkError::Storage {
                    kind: StorageFailure::Integrity,
                    message,
                    ..
                } => BulkError::integrity(&handle.location, message),
                other => other,
            })?;
        Ok(())
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> BulkResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key(&handle.location))
            .upload_id(&handle.upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match sdk_failure("abort_upload", &handle.location, e) {
                BulkError::Storage {
                    kind: StorageFailure::NotFound,
                    ..
                } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn put_object(&self, location: &str, body: Bytes) -> BulkResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key(location))
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| sdk_failure("put_object", location, e))?;
        Ok(())
    }

    async fn ensure_destination_exists(&self, location: &str) -> BulkResult<()> {
        let head = self.client.head_bucket().bucket(&self.bucket).send().await;
        let err = match head {
            Ok(_) => return Ok(()),
            Err(e) => sdk_failure("ensure_destination", location, e),
        };
        // HeadBucket carries no error code, only the status.
        if !matches!(
            err,
            BulkError::Storage {
                kind: StorageFailure::NotFound,
                ..
            }
        ) {
            return Err(err);
        }

        tracing::info!(bucket = %self.bucket, "creating missing bucket");
        let mut create = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match create.send().await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code(), Some("BucketAlreadyOwnedByYou")) => Ok(()),
            Err(e) => Err(sdk_failure("ensure_destination", location, e)),
        }
    }
}
