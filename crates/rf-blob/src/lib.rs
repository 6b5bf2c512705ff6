// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed blob store.
//!
//! Blobs live under `<movieId>/blobs/<xx>/<hash>[.<ext>]` where `<xx>` is
//! the first two hex characters of the SHA-256 hash. Identical bytes
//! persisted twice in one movie dedup to a single object. Blobs are never
//! mutated; deletion only happens through whole-movie teardown.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rf_core::BlobRef;
use rf_storage::{ListOptions, Storage, StorageContext, StorageError, StoragePath, WriteOptions};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No blob exists for the hash.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Map a MIME type to the file extension blobs are stored under.
///
/// Unknown `audio/*`, `video/*`, and `image/*` subtypes fall back to the
/// subtype itself; `application/octet-stream` stores with no extension.
pub fn extension_for(mime_type: &str) -> Option<&str> {
    match mime_type {
        "audio/mpeg" => Some("mp3"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/ogg" => Some("ogg"),
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        "application/json" => Some("json"),
        "text/plain" => Some("txt"),
        "application/octet-stream" => None,
        other => {
            let (family, subtype) = other.split_once('/')?;
            match family {
                "audio" | "video" | "image" if !subtype.is_empty() => Some(subtype),
                _ => None,
            }
        }
    }
}

/// Content-addressed blob store bound to one movie.
#[derive(Clone)]
pub struct BlobStore {
    ctx: StorageContext,
    movie_id: String,
}

impl BlobStore {
    /// Bind a store to a movie.
    pub fn new(ctx: StorageContext, movie_id: impl Into<String>) -> Self {
        Self {
            ctx,
            movie_id: movie_id.into(),
        }
    }

    fn shard_dir(&self, hash: &str) -> StoragePath {
        self.ctx
            .resolve(&self.movie_id, ["blobs", &hash[..2.min(hash.len())]])
    }

    fn blob_path(&self, hash: &str, mime_type: &str) -> StoragePath {
        let name = match extension_for(mime_type) {
            Some(ext) => format!("{hash}.{ext}"),
            None => hash.to_string(),
        };
        self.shard_dir(hash).join(name)
    }

    /// Persist bytes, returning their content-addressed reference.
    ///
    /// If an object already exists at the derived path with equal size the
    /// bytes are not rewritten.
    pub async fn persist(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<BlobRef, BlobError> {
        let hash = rf_hash::hash_bytes(bytes);
        let path = self.blob_path(&hash, mime_type);
        let blob_ref = BlobRef {
            hash: hash.clone(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        };

        let shard = self.shard_dir(&hash);
        let existing = self
            .ctx
            .backend()
            .list(&shard, ListOptions::default())
            .await?;
        if existing
            .iter()
            .any(|e| e.path == path && e.size == bytes.len() as u64)
        {
            debug!(target: "rf.blob", %hash, "blob already persisted, skipping write");
            return Ok(blob_ref);
        }

        let opts = WriteOptions {
            mime_type: Some(mime_type.to_string()),
        };
        rf_storage::with_backoff("blob_persist", || {
            self.ctx.backend().write(&path, bytes, opts.clone())
        })
        .await?;
        Ok(blob_ref)
    }

    /// Read a blob's bytes by reference.
    ///
    /// The extension-carrying filename is tried first; the bare hash is a
    /// legacy layout that stays read-compatible.
    pub async fn read(&self, blob_ref: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let primary = self.blob_path(&blob_ref.hash, &blob_ref.mime_type);
        match self.ctx.backend().read_to_bytes(&primary).await {
            Ok(bytes) => return Ok(bytes),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let bare = self.shard_dir(&blob_ref.hash).join(&blob_ref.hash);
        if bare != primary {
            match self.ctx.backend().read_to_bytes(&bare).await {
                Ok(bytes) => return Ok(bytes),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Last resort: any extension under the shard (the ref may carry a
        // different MIME type than the writer recorded).
        let shard = self.shard_dir(&blob_ref.hash);
        let entries = self
            .ctx
            .backend()
            .list(&shard, ListOptions::default())
            .await?;
        for entry in entries {
            if let Some(name) = entry.path.file_name() {
                if name == blob_ref.hash || name.starts_with(&format!("{}.", blob_ref.hash)) {
                    return Ok(self.ctx.backend().read_to_bytes(&entry.path).await?);
                }
            }
        }
        Err(BlobError::NotFound(blob_ref.hash.clone()))
    }

    /// Whether a blob with the given reference is present.
    pub async fn exists(&self, blob_ref: &BlobRef) -> Result<bool, BlobError> {
        match self.read(blob_ref).await {
            Ok(_) => Ok(true),
            Err(BlobError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
