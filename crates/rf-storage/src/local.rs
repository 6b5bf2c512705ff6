// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local filesystem backend.
//!
//! Writes go through a temp-file-plus-rename so readers never observe a
//! partially written file.

use crate::{
    DeleteOptions, EntryKind, ListEntry, ListOptions, Storage, StorageError, StoragePath,
    WriteOptions,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// [`Storage`] backend over a local directory root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn abs(&self, path: &StoragePath) -> PathBuf {
        let mut p = self.root.clone();
        for seg in path.as_str().split('/').filter(|s| !s.is_empty()) {
            p.push(seg);
        }
        p
    }

    fn rel(&self, abs: &Path) -> StoragePath {
        let stripped = abs.strip_prefix(&self.root).unwrap_or(abs);
        StoragePath::from_parts(stripped.components().map(|c| c.as_os_str().to_string_lossy()))
    }
}

fn map_io(path: &StoragePath, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.clone())
    } else {
        StorageError::Io {
            path: path.clone(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn file_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        match tokio::fs::metadata(self.abs(path)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn directory_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        match tokio::fs::metadata(self.abs(path)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn read_to_string(&self, path: &StoragePath) -> Result<String, StorageError> {
        tokio::fs::read_to_string(self.abs(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn read_to_bytes(&self, path: &StoragePath) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.abs(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn write(
        &self,
        path: &StoragePath,
        bytes: &[u8],
        _opts: WriteOptions,
    ) -> Result<(), StorageError> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }
        // Temp sibling in the same directory so the rename stays on one
        // filesystem.
        let tmp = abs.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| map_io(path, e))?;
        file.write_all(bytes).await.map_err(|e| map_io(path, e))?;
        file.sync_all().await.map_err(|e| map_io(path, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &abs)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn append(&self, path: &StoragePath, bytes: &[u8]) -> Result<(), StorageError> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&abs)
            .await
            .map_err(|e| map_io(path, e))?;
        file.write_all(bytes).await.map_err(|e| map_io(path, e))?;
        file.sync_all().await.map_err(|e| map_io(path, e))
    }

    async fn list(
        &self,
        path: &StoragePath,
        opts: ListOptions,
    ) -> Result<Vec<ListEntry>, StorageError> {
        let abs = self.abs(path);
        if !abs.is_dir() {
            return Ok(Vec::new());
        }
        if !opts.deep {
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(&abs).await.map_err(|e| map_io(path, e))?;
            while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
                let meta = entry.metadata().await.map_err(|e| map_io(path, e))?;
                entries.push(ListEntry {
                    kind: if meta.is_dir() {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                    path: self.rel(&entry.path()),
                    size: if meta.is_file() { meta.len() } else { 0 },
                });
            }
            return Ok(entries);
        }
        // Deep listing walks synchronously off the async thread.
        let this = self.clone();
        let path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in WalkDir::new(this.abs(&path)).min_depth(1) {
                let entry = entry.map_err(|e| StorageError::Io {
                    path: path.clone(),
                    message: e.to_string(),
                    source: Some(Box::new(e)),
                })?;
                let meta = entry.metadata().map_err(|e| StorageError::Io {
                    path: path.clone(),
                    message: e.to_string(),
                    source: Some(Box::new(e)),
                })?;
                entries.push(ListEntry {
                    kind: if meta.is_dir() {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                    path: this.rel(entry.path()),
                    size: if meta.is_file() { meta.len() } else { 0 },
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StorageError::Io {
            path: StoragePath::default(),
            message: format!("list task failed: {e}"),
            source: None,
        })?
    }

    async fn delete(&self, path: &StoragePath, opts: DeleteOptions) -> Result<(), StorageError> {
        let abs = self.abs(path);
        let meta = match tokio::fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(path, e)),
        };
        if meta.is_dir() {
            if !opts.recursive {
                return Err(StorageError::Io {
                    path: path.clone(),
                    message: "refusing to delete directory without recursive".into(),
                    source: None,
                });
            }
            tokio::fs::remove_dir_all(&abs)
                .await
                .map_err(|e| map_io(path, e))
        } else {
            tokio::fs::remove_file(&abs)
                .await
                .map_err(|e| map_io(path, e))
        }
    }
}
