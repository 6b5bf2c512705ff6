// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage backend capability interface.
//!
//! Everything the engine persists goes through the [`Storage`] trait: a
//! small capability surface over a rooted file tree. Two production
//! backends exist (the local filesystem and an S3-compatible object store)
//! plus an in-memory backend for tests.
//!
//! Writes are atomic with respect to readers: a concurrent reader sees
//! either the prior bytes or the complete new bytes, never a partial file.
//! [`Storage::list`] returns entries in an unspecified order; callers sort
//! when they need stable output.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod local;
mod memory;
mod s3;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::{S3Config, S3Storage};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// A normalized, `/`-separated path relative to a backend's root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoragePath(String);

impl StoragePath {
    /// Build a path from segments, skipping empty ones.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = parts
            .into_iter()
            .flat_map(|p| {
                p.as_ref()
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        StoragePath(joined.join("/"))
    }

    /// Append further segments.
    #[must_use]
    pub fn join<S: AsRef<str>>(&self, part: S) -> Self {
        StoragePath::from_parts([self.0.as_str(), part.as_ref()])
    }

    /// The path as a `/`-separated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// The path without its final segment.
    pub fn parent(&self) -> Option<StoragePath> {
        let idx = self.0.rfind('/')?;
        Some(StoragePath(self.0[..idx].to_string()))
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoragePath {
    fn from(s: &str) -> Self {
        StoragePath::from_parts([s])
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(StoragePath),

    /// An I/O failure at a specific path.
    #[error("storage i/o failure at `{path}`: {message}")]
    Io {
        /// Path the operation targeted.
        path: StoragePath,
        /// Backend-specific description.
        message: String,
        /// Underlying cause, when available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stored content failed to decode (UTF-8 or JSON).
    #[error("corrupt content at `{path}`: {message}")]
    Corrupt {
        /// Path of the offending file.
        path: StoragePath,
        /// Decode failure description.
        message: String,
    },

    /// The backend is misconfigured (missing credentials, bad bucket…).
    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// `true` when retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io { .. })
    }
}

// ---------------------------------------------------------------------------
// Listing and options
// ---------------------------------------------------------------------------

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file / object.
    File,
    /// A directory / common prefix.
    Dir,
}

/// One entry returned by [`Storage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Full path of the entry.
    pub path: StoragePath,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

/// Options for [`Storage::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// MIME type recorded by backends that support it (object stores).
    pub mime_type: Option<String>,
}

/// Options for [`Storage::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Recurse into subdirectories.
    pub deep: bool,
}

/// Options for [`Storage::delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Delete directories and their contents.
    pub recursive: bool,
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// Capability interface over a rooted file tree.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether a file exists at the path.
    async fn file_exists(&self, path: &StoragePath) -> Result<bool, StorageError>;

    /// Whether a directory (or key prefix) exists at the path.
    async fn directory_exists(&self, path: &StoragePath) -> Result<bool, StorageError>;

    /// Read the file as UTF-8 text.
    async fn read_to_string(&self, path: &StoragePath) -> Result<String, StorageError>;

    /// Read the file as raw bytes.
    async fn read_to_bytes(&self, path: &StoragePath) -> Result<Vec<u8>, StorageError>;

    /// Write bytes, creating parent directories and swapping atomically.
    async fn write(
        &self,
        path: &StoragePath,
        bytes: &[u8],
        opts: WriteOptions,
    ) -> Result<(), StorageError>;

    /// Append bytes to the file, creating it if absent.
    ///
    /// Appends are not atomic across processes; the engine serializes
    /// writers per file (see the event log).
    async fn append(&self, path: &StoragePath, bytes: &[u8]) -> Result<(), StorageError>;

    /// List entries under a directory. Missing directories list as empty.
    async fn list(
        &self,
        path: &StoragePath,
        opts: ListOptions,
    ) -> Result<Vec<ListEntry>, StorageError>;

    /// Delete a file, or a directory when `recursive` is set.
    async fn delete(&self, path: &StoragePath, opts: DeleteOptions) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run a storage operation with bounded exponential backoff.
///
/// Transient failures ([`StorageError::is_transient`]) are retried up to
/// three attempts; everything else returns immediately.
pub async fn with_backoff<T, F, Fut>(target: &str, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    target: "rf.storage",
                    %target,
                    attempt,
                    error = %err,
                    "transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageContext
// ---------------------------------------------------------------------------

/// A backend plus the base path every movie lives under.
#[derive(Clone)]
pub struct StorageContext {
    backend: Arc<dyn Storage>,
    base_path: StoragePath,
}

impl StorageContext {
    /// Wrap a backend with a base path (may be empty).
    pub fn new(backend: Arc<dyn Storage>, base_path: impl Into<StoragePath>) -> Self {
        Self {
            backend,
            base_path: base_path.into(),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn Storage> {
        &self.backend
    }

    /// Resolve a path under the base path.
    pub fn resolve_base<I, S>(&self, parts: I) -> StoragePath
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = self.base_path.clone();
        for part in parts {
            path = path.join(part);
        }
        path
    }

    /// Resolve a path under a movie's root.
    pub fn resolve<I, S>(&self, movie_id: &str, parts: I) -> StoragePath
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = self.base_path.join(movie_id);
        for part in parts {
            path = path.join(part);
        }
        path
    }

    /// Read and decode a JSON file.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        path: &StoragePath,
    ) -> Result<T, StorageError> {
        let text = with_backoff("read_json", || self.backend.read_to_string(path)).await?;
        serde_json::from_str(&text).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })
    }

    /// Encode and atomically write a JSON file.
    pub async fn write_json<T: Serialize>(
        &self,
        path: &StoragePath,
        value: &T,
    ) -> Result<(), StorageError> {
        let text = serde_json::to_string_pretty(value).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let opts = WriteOptions {
            mime_type: Some("application/json".into()),
        };
        with_backoff("write_json", || {
            self.backend.write(path, text.as_bytes(), opts.clone())
        })
        .await
    }
}

impl From<String> for StoragePath {
    fn from(s: String) -> Self {
        StoragePath::from_parts([s])
    }
}
