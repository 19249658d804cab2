//! Local file system provider.
//!
//! Multi-part uploads are staged as numbered files in a sibling directory
//! `<object>.upload-<id>/` and concatenated on completion. Part identifiers
//! are the SHA-256 digest of the part body, re-checked before assembly.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::{ByteStream, StorageProvider, StorageType, UploadHandle};
use crate::checkpoint::CompletedPart;
use crate::config::FileStorageSettings;
use crate::context::JobContext;
use crate::error::{BulkError, BulkResult, StorageFailure};

pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &FileStorageSettings, ctx: &JobContext) -> Self {
        let mut root = PathBuf::from(&settings.base_dir);
        if settings.tenant_isolation {
            root.push(&ctx.tenant_id);
        }
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> BulkResult<PathBuf> {
        let relative = Path::new(location.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BulkError::InvalidObjectPath {
                path: location.to_string(),
                message: "location must stay below the storage root".into(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn staging_dir(&self, handle: &UploadHandle) -> BulkResult<PathBuf> {
        let target = self.resolve(&handle.location)?;
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".upload-{}", handle.upload_id));
        Ok(target.with_file_name(name))
    }
}

fn io_failure(op: &'static str, location: &str, err: std::io::Error) -> BulkError {
    use std::io::ErrorKind as Io;
    let kind = match err.kind() {
        Io::NotFound => StorageFailure::NotFound,
        Io::PermissionDenied => StorageFailure::Denied,
        Io::TimedOut | Io::Interrupted | Io::WouldBlock => StorageFailure::Timeout,
        _ => StorageFailure::Other,
    };
    BulkError::storage(op, location, kind, err)
}

fn part_file(dir: &Path, part_number: u32) -> PathBuf {
    dir.join(format!("{part_number:05}"))
}

fn digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[async_trait]
impl StorageProvider for FileProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    async fn size(&self, location: &str) -> BulkResult<u64> {
        let path = self.resolve(location)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| io_failure("size", location, e))?;
        Ok(meta.len())
    }

    async fn list(&self, prefix: &str) -> BulkResult<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_failure("list", prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_failure("list", prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_failure("list", prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                // Staged parts are not objects.
                if key.contains(".upload-") {
                    continue;
                }
                if key.starts_with(prefix.trim_start_matches('/')) {
                    found.push(key);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn open_bytes(&self, location: &str, offset: u64) -> BulkResult<ByteStream> {
        let path = self.resolve(location)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| io_failure("open", location, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_failure("open", location, e))?;
        }
        let location = location.to_string();
        Ok(ReaderStream::new(file)
            .map(move |chunk| chunk.map_err(|e| io_failure("read", &location, e)))
            .boxed())
    }

    async fn start_or_continue_upload(
        &self,
        location: &str,
        upload_id: Option<&str>,
    ) -> BulkResult<UploadHandle> {
        let handle = UploadHandle {
            location: location.to_string(),
            upload_id: upload_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        };
        let dir = self.staging_dir(&handle)?;
        if upload_id.is_some() && !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(BulkError::integrity(
                location,
                format!("staged upload '{}' no longer exists", handle.upload_id),
            ));
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_failure("start_upload", location, e))?;
        Ok(handle)
    }

    async fn write_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        body: Bytes,
    ) -> BulkResult<String> {
        let dir = self.staging_dir(handle)?;
        let path = part_file(&dir, part_number);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| io_failure("write_part", &handle.location, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| io_failure("write_part", &handle.location, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_failure("write_part", &handle.location, e))?;
        Ok(digest(&body))
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[CompletedPart],
    ) -> BulkResult<()> {
        let dir = self.staging_dir(handle)?;
        let target = self.resolve(&handle.location)?;
        let assembled = dir.join("assembled");
        let mut out = fs::File::create(&assembled)
            .await
            .map_err(|e| io_failure("complete_upload", &handle.location, e))?;
        for part in parts {
            let body = fs::read(part_file(&dir, part.part_number))
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => BulkError::integrity(
                        &handle.location,
                        format!("part {} is missing", part.part_number),
                    ),
                    _ => io_failure("complete_upload", &handle.location, e),
                })?;
            if digest(&body) != part.part_id {
                return Err(BulkError::integrity(
                    &handle.location,
                    format!("part {} does not match its digest", part.part_number),
                ));
            }
            out.write_all(&body)
                .await
                .map_err(|e| io_failure("complete_upload", &handle.location, e))?;
        }
        out.sync_all()
            .await
            .map_err(|e| io_failure("complete_upload", &handle.location, e))?;
        drop(out);
        fs::rename(&assembled, &target)
            .await
            .map_err(|e| io_failure("complete_upload", &handle.location, e))?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_failure("complete_upload", &handle.location, e))?;
        Ok(())
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> BulkResult<()> {
        let dir = self.staging_dir(handle)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure("abort_upload", &handle.location, e)),
        }
    }

    async fn put_object(&self, location: &str, body: Bytes) -> BulkResult<()> {
        let path = self.resolve(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("put_object", location, e))?;
        }
        fs::write(&path, &body)
            .await
            .map_err(|e| io_failure("put_object", location, e))
    }

    async fn ensure_destination_exists(&self, location: &str) -> BulkResult<()> {
        let path = self.resolve(location)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| io_failure("ensure_destination", location, e))
    }
}
