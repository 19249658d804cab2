//! Storage providers.
//!
//! A [`StorageProvider`] hides one physical backend (local file system,
//! read-only HTTPS, S3-compatible object storage, Azure blob storage) behind
//! the same read / multi-part write contract. Providers only move raw bytes;
//! record framing lives in this module and is shared by every backend.
//!
//! Providers are looked up by [`StorageType`] through a [`ProviderRegistry`]
//! populated at process start.

mod azure;
mod fs;
mod https;
mod s3;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

pub use azure::AzureBlobProvider;
pub use fs::FileProvider;
pub use https::HttpsProvider;
pub use s3::S3Provider;

use crate::checkpoint::CompletedPart;
use crate::config::StorageSettings;
use crate::context::JobContext;
use crate::error::{BulkError, BulkResult, StorageFailure};

/// Raw bytes of an object, in order.
pub type ByteStream = BoxStream<'static, BulkResult<Bytes>>;

/// One raw record per item, separators removed.
pub type RecordStream = BoxStream<'static, BulkResult<Bytes>>;

/// Backend tag declared on a job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[serde(alias = "filesystem", alias = "local")]
    File,
    #[serde(alias = "http")]
    Https,
    #[serde(alias = "aws-s3", alias = "ibm-cos")]
    S3,
    #[serde(alias = "azure-blob")]
    Azure,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Https => "https",
            Self::S3 => "s3",
            Self::Azure => "azure",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "filesystem" | "local" => Ok(Self::File),
            "https" | "http" => Ok(Self::Https),
            "s3" | "aws-s3" | "ibm-cos" => Ok(Self::S3),
            "azure" | "azure-blob" => Ok(Self::Azure),
            other => Err(BulkError::UnknownStorageType(other.to_string())),
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split `[0, total)` into consecutive ranges of at most `segment` bytes.
    pub fn split(total: u64, segment: u64) -> Vec<ByteRange> {
        if segment == 0 || total == 0 {
            return vec![ByteRange::new(0, total)];
        }
        (0..total)
            .step_by(segment as usize)
            .map(|start| ByteRange::new(start, (start + segment).min(total)))
            .collect()
    }
}

/// An open multi-part upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub location: String,
    pub upload_id: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// Whether `open_bytes` can start at an arbitrary offset cheaply.
    fn supports_ranged_reads(&self) -> bool {
        true
    }

    /// Minimum size of every part but the last one.
    fn min_part_bytes(&self) -> usize {
        0
    }

    async fn size(&self, location: &str) -> BulkResult<u64>;

    /// Object locations below `prefix`, sorted.
    async fn list(&self, prefix: &str) -> BulkResult<Vec<String>>;

    /// Stream the object's bytes from `offset` to the end.
    async fn open_bytes(&self, location: &str, offset: u64) -> BulkResult<ByteStream>;

    async fn start_or_continue_upload(
        &self,
        location: &str,
        upload_id: Option<&str>,
    ) -> BulkResult<UploadHandle>;

    /// Upload one part; returns the identifier needed to complete the upload.
    async fn write_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        body: Bytes,
    ) -> BulkResult<String>;

    async fn complete_upload(&self, handle: &UploadHandle, parts: &[CompletedPart])
    -> BulkResult<()>;

    /// Best-effort cleanup of an upload that will never complete.
    async fn abort_upload(&self, handle: &UploadHandle) -> BulkResult<()>;

    /// Write a whole object in one request.
    async fn put_object(&self, location: &str, body: Bytes) -> BulkResult<()>;

    async fn ensure_destination_exists(&self, location: &str) -> BulkResult<()>;

    async fn exists(&self, location: &str) -> BulkResult<bool> {
        match self.size(location).await {
            Ok(_) => Ok(true),
            Err(BulkError::Storage {
                kind: StorageFailure::NotFound,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lazily read records, skipping the first `skip_records`.
    async fn open_for_read(&self, location: &str, skip_records: u64) -> BulkResult<RecordStream> {
        let bytes = self.open_bytes(location, 0).await?;
        Ok(frame_records(bytes, 0, None, false, skip_records))
    }

    /// Lazily read the records whose first byte lies inside `range`.
    async fn open_segment(
        &self,
        location: &str,
        range: ByteRange,
        skip_records: u64,
    ) -> BulkResult<RecordStream> {
        // Read one byte early so a line starting exactly at `range.start` is kept.
        let from = range.start.saturating_sub(1);
        let bytes = self.open_bytes(location, from).await?;
        Ok(frame_records(
            bytes,
            from,
            Some(range.end),
            range.start > 0,
            skip_records,
        ))
    }
}

struct Framer {
    inner: ByteStream,
    buf: BytesMut,
    /// Absolute offset of `buf[0]`.
    offset: u64,
    end: Option<u64>,
    discard_partial: bool,
    skip: u64,
    exhausted: bool,
}

impl Framer {
    async fn next_record(&mut self) -> Option<BulkResult<Bytes>> {
        loop {
            if self.discard_partial {
                if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                    self.buf.advance(pos + 1);
                    self.offset += pos as u64 + 1;
                    self.discard_partial = false;
                    continue;
                }
                // Partial line runs to EOF; drop it and read on.
                self.offset += self.buf.len() as u64;
                self.buf.clear();
            } else {
                if self.end.is_some_and(|end| self.offset >= end) {
                    return None;
                }
                let line = match self.buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => Some(self.buf.split_to(pos + 1)),
                    None if self.exhausted && !self.buf.is_empty() => Some(self.buf.split()),
                    None if self.exhausted => return None,
                    None => None,
                };
                if let Some(mut line) = line {
                    self.offset += line.len() as u64;
                    while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    if self.skip > 0 {
                        self.skip -= 1;
                        continue;
                    }
                    return Some(Ok(line.freeze()));
                }
            }

            if self.exhausted {
                return None;
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.exhausted = true;
                    self.buf.clear();
                    return Some(Err(e));
                }
                None => self.exhausted = true,
            }
        }
    }
}

/// Split a byte stream into newline-delimited records.
///
/// `offset` is the absolute position of the first byte of `bytes`. With an
/// `end`, only records starting before it are produced. With
/// `discard_partial`, everything up to the first newline is dropped. Blank
/// lines are ignored and a trailing `\r` is stripped.
pub fn frame_records(
    bytes: ByteStream,
    offset: u64,
    end: Option<u64>,
    discard_partial: bool,
    skip_records: u64,
) -> RecordStream {
    let framer = Framer {
        inner: bytes,
        buf: BytesMut::new(),
        offset,
        end,
        discard_partial,
        skip: skip_records,
        exhausted: false,
    };
    stream::unfold(framer, |mut framer| async move {
        framer.next_record().await.map(|item| (item, framer))
    })
    .boxed()
}

pub type ProviderFactory = Arc<
    dyn Fn(&StorageSettings, &JobContext) -> BulkResult<Arc<dyn StorageProvider>> + Send + Sync,
>;

/// Maps storage-type tags to provider constructors.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<StorageType, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in file, HTTPS, S3 and Azure providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            StorageType::File,
            Arc::new(|settings, ctx| {
                Ok(Arc::new(FileProvider::from_settings(&settings.file, ctx)) as Arc<dyn StorageProvider>)
            }),
        );
        registry.register(
            StorageType::Https,
            Arc::new(|settings, _ctx| {
                Ok(Arc::new(HttpsProvider::new(&settings.https)?) as Arc<dyn StorageProvider>)
            }),
        );
        registry.register(
            StorageType::S3,
            Arc::new(|settings, _ctx| {
                let s3 = settings
                    .s3
                    .as_ref()
                    .ok_or_else(|| BulkError::Config("storage.s3 is not configured".into()))?;
                Ok(Arc::new(S3Provider::new(s3)) as Arc<dyn StorageProvider>)
            }),
        );
        registry.register(
            StorageType::Azure,
            Arc::new(|settings, _ctx| {
                let azure = settings
                    .azure
                    .as_ref()
                    .ok_or_else(|| BulkError::Config("storage.azure is not configured".into()))?;
                Ok(Arc::new(AzureBlobProvider::new(azure, &settings.https)?)
                    as Arc<dyn StorageProvider>)
            }),
        );
        registry
    }

    pub fn register(&mut self, storage_type: StorageType, factory: ProviderFactory) {
        self.factories.insert(storage_type, factory);
    }

    pub fn contains(&self, storage_type: StorageType) -> bool {
        self.factories.contains_key(&storage_type)
    }

    pub fn create(
        &self,
        storage_type: StorageType,
        settings: &StorageSettings,
        ctx: &JobContext,
    ) -> BulkResult<Arc<dyn StorageProvider>> {
        let factory = self
            .factories
            .get(&storage_type)
            .ok_or_else(|| BulkError::UnknownStorageType(storage_type.to_string()))?;
        factory(settings, ctx)
    }
}
