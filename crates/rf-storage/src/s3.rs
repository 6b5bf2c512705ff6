// SPDX-License-Identifier: MIT OR Apache-2.0
//! S3-compatible object-store backend.
//!
//! Keys mirror the local backend's relative paths. Directories are implicit
//! prefixes; existence checks use object-level metadata (`HeadObject`).
//! Uploads above [`MULTIPART_THRESHOLD`] go through a multipart upload.

use crate::{
    DeleteOptions, EntryKind, ListEntry, ListOptions, Storage, StorageError, StoragePath,
    WriteOptions,
};
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

/// Objects at or above this size upload via multipart (AWS recommends
/// multipart above 5 MB; we use 8 MB chunks).
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Environment-driven configuration for [`S3Storage`].
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Access key id (`S3_ACCESS_KEY_ID`).
    pub access_key_id: Option<String>,
    /// Secret access key (`S3_SECRET_ACCESS_KEY`).
    pub secret_access_key: Option<String>,
    /// Custom endpoint URL (`S3_ENDPOINT`), for non-AWS stores.
    pub endpoint: Option<String>,
    /// Bucket name (`S3_BUCKET`).
    pub bucket: String,
    /// Region (`S3_REGION`), defaulting to `auto`.
    pub region: String,
}

impl S3Config {
    /// Read configuration from the `S3_*` environment variables.
    pub fn from_env() -> Result<Self, StorageError> {
        let bucket = std::env::var("S3_BUCKET")
            .map_err(|_| StorageError::Config("S3_BUCKET is not set".into()))?;
        Ok(Self {
            access_key_id: std::env::var("S3_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY").ok(),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            bucket,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "auto".into()),
        })
    }
}

/// [`Storage`] backend over an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Build a client from configuration.
    pub async fn connect(config: S3Config) -> Result<Self, StorageError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let (Some(key), Some(secret)) = (
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
        ) {
            loader =
                loader.credentials_provider(Credentials::new(key, secret, None, None, "reelforge"));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }

    /// Wrap an existing client (useful against LocalStack in tests).
    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    async fn put(
        &self,
        path: &StoragePath,
        bytes: &[u8],
        mime_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let content_type = mime_type.unwrap_or("application/octet-stream");
        if bytes.len() < MULTIPART_THRESHOLD {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(path.as_str())
                .body(ByteStream::from(bytes.to_vec()))
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| op_error(path, "put_object", e))?;
            return Ok(());
        }

        debug!(target: "rf.storage", key = %path, size = bytes.len(), "multipart upload");
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(path.as_str())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| op_error(path, "create_multipart_upload", e))?;
        let upload_id = created.upload_id().ok_or_else(|| StorageError::Io {
            path: path.clone(),
            message: "no multipart upload id returned".into(),
            source: None,
        })?;

        let mut completed_parts = Vec::new();
        let mut offset = 0usize;
        let mut part_number = 1i32;
        while offset < bytes.len() {
            let end = usize::min(offset + MULTIPART_CHUNK_SIZE, bytes.len());
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(path.as_str())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes[offset..end].to_vec()))
                .send()
                .await
                .map_err(|e| op_error(path, "upload_part", e))?;
            let e_tag = part.e_tag().ok_or_else(|| StorageError::Io {
                path: path.clone(),
                message: format!("no etag returned for part {part_number}"),
                source: None,
            })?;
            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(e_tag)
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(path.as_str())
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| op_error(path, "complete_multipart_upload", e))?;
        Ok(())
    }

    async fn list_keys(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(d) = delimiter {
                req = req.delimiter(d);
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let out = req
                .send()
                .await
                .map_err(|e| op_error(&StoragePath::from(prefix), "list_objects_v2", e))?;
            for obj in out.contents() {
                if let Some(key) = obj.key() {
                    entries.push(ListEntry {
                        kind: EntryKind::File,
                        path: StoragePath::from(key),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
            for common in out.common_prefixes() {
                if let Some(p) = common.prefix() {
                    entries.push(ListEntry {
                        kind: EntryKind::Dir,
                        path: StoragePath::from(p.trim_end_matches('/')),
                        size: 0,
                    });
                }
            }
            match out.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }
}

fn op_error<E: std::error::Error + Send + Sync + 'static>(
    path: &StoragePath,
    op: &str,
    err: E,
) -> StorageError {
    // The SDK nests the service error; the rendered message carries the
    // machine code (NoSuchKey, NotFound, ...).
    let rendered = format!("{err}");
    let mut source: &dyn std::error::Error = &err;
    let mut detail = rendered.clone();
    while let Some(inner) = source.source() {
        detail = inner.to_string();
        source = inner;
    }
    if detail.contains("NoSuchKey") || detail.contains("NotFound") {
        return StorageError::NotFound(path.clone());
    }
    StorageError::Io {
        path: path.clone(),
        message: format!("{op}: {detail}"),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn file_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match op_error(path, "head_object", e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn directory_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        let prefix = format!("{}/", path.as_str());
        let out = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| op_error(path, "list_objects_v2", e))?;
        Ok(out.key_count().unwrap_or(0) > 0)
    }

    async fn read_to_string(&self, path: &StoragePath) -> Result<String, StorageError> {
        let bytes = self.read_to_bytes(path).await?;
        String::from_utf8(bytes).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })
    }

    async fn read_to_bytes(&self, path: &StoragePath) -> Result<Vec<u8>, StorageError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
            .map_err(|e| op_error(path, "get_object", e))?;
        let collected = out.body.collect().await.map_err(|e| StorageError::Io {
            path: path.clone(),
            message: format!("read body: {e}"),
            source: Some(Box::new(e)),
        })?;
        Ok(collected.into_bytes().to_vec())
    }

    async fn write(
        &self,
        path: &StoragePath,
        bytes: &[u8],
        opts: WriteOptions,
    ) -> Result<(), StorageError> {
        // Object puts are atomic on the service side; no temp object needed.
        self.put(path, bytes, opts.mime_type.as_deref()).await
    }

    async fn append(&self, path: &StoragePath, bytes: &[u8]) -> Result<(), StorageError> {
        // Object stores have no append; read-modify-write is safe because
        // the engine serializes writers per file.
        let mut current = match self.read_to_bytes(path).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        current.extend_from_slice(bytes);
        self.put(path, &current, Some("application/x-ndjson")).await
    }

    async fn list(
        &self,
        path: &StoragePath,
        opts: ListOptions,
    ) -> Result<Vec<ListEntry>, StorageError> {
        let prefix = if path.as_str().is_empty() {
            String::new()
        } else {
            format!("{}/", path.as_str())
        };
        let delimiter = if opts.deep { None } else { Some("/") };
        self.list_keys(&prefix, delimiter).await
    }

    async fn delete(&self, path: &StoragePath, opts: DeleteOptions) -> Result<(), StorageError> {
        if self.file_exists(path).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(path.as_str())
                .send()
                .await
                .map_err(|e| op_error(path, "delete_object", e))?;
            return Ok(());
        }
        if !opts.recursive {
            return Ok(());
        }
        let entries = self.list(path, ListOptions { deep: true }).await?;
        for entry in entries {
            if entry.kind == EntryKind::File {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(entry.path.as_str())
                    .send()
                    .await
                    .map_err(|e| op_error(&entry.path, "delete_object", e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_error_maps_missing_keys_to_not_found() {
        let path = StoragePath::from("m1/current.json");
        let err = std::io::Error::other("service error: NoSuchKey: the key does not exist");
        assert!(matches!(
            op_error(&path, "get_object", err),
            StorageError::NotFound(_)
        ));
        let err = std::io::Error::other("dispatch failure: timeout");
        assert!(matches!(
            op_error(&path, "get_object", err),
            StorageError::Io { .. }
        ));
    }
}
