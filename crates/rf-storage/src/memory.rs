// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory backend for tests.

use crate::{
    DeleteOptions, EntryKind, ListEntry, ListOptions, Storage, StorageError, StoragePath,
    WriteOptions,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// [`Storage`] backend over an in-memory map, mirroring the local backend's
/// semantics (whole-file atomic writes, implicit directories).
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files.
    pub async fn file_count(&self) -> usize {
        self.files.read().await.len()
    }
}

fn dir_prefix(path: &StoragePath) -> String {
    if path.as_str().is_empty() {
        String::new()
    } else {
        format!("{}/", path.as_str())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn file_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        Ok(self.files.read().await.contains_key(path.as_str()))
    }

    async fn directory_exists(&self, path: &StoragePath) -> Result<bool, StorageError> {
        let prefix = dir_prefix(path);
        Ok(self
            .files
            .read()
            .await
            .keys()
            .any(|k| k.starts_with(&prefix)))
    }

    async fn read_to_string(&self, path: &StoragePath) -> Result<String, StorageError> {
        let bytes = self.read_to_bytes(path).await?;
        String::from_utf8(bytes).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })
    }

    async fn read_to_bytes(&self, path: &StoragePath) -> Result<Vec<u8>, StorageError> {
        self.files
            .read()
            .await
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.clone()))
    }

    async fn write(
        &self,
        path: &StoragePath,
        bytes: &[u8],
        _opts: WriteOptions,
    ) -> Result<(), StorageError> {
        self.files
            .write()
            .await
            .insert(path.as_str().to_string(), bytes.to_vec());
        Ok(())
    }

    async fn append(&self, path: &StoragePath, bytes: &[u8]) -> Result<(), StorageError> {
        self.files
            .write()
            .await
            .entry(path.as_str().to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn list(
        &self,
        path: &StoragePath,
        opts: ListOptions,
    ) -> Result<Vec<ListEntry>, StorageError> {
        let prefix = dir_prefix(path);
        let files = self.files.read().await;
        let mut entries = Vec::new();
        let mut dirs = std::collections::BTreeSet::new();
        for (key, bytes) in files.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => entries.push(ListEntry {
                    kind: EntryKind::File,
                    path: StoragePath::from(key.as_str()),
                    size: bytes.len() as u64,
                }),
                Some((dir, _)) if opts.deep => {
                    dirs.insert(format!("{prefix}{dir}"));
                    entries.push(ListEntry {
                        kind: EntryKind::File,
                        path: StoragePath::from(key.as_str()),
                        size: bytes.len() as u64,
                    });
                }
                Some((dir, _)) => {
                    dirs.insert(format!("{prefix}{dir}"));
                }
            }
        }
        for dir in dirs {
            entries.push(ListEntry {
                kind: EntryKind::Dir,
                path: StoragePath::from(dir.as_str()),
                size: 0,
            });
        }
        Ok(entries)
    }

    async fn delete(&self, path: &StoragePath, opts: DeleteOptions) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        if files.remove(path.as_str()).is_some() {
            return Ok(());
        }
        let prefix = dir_prefix(path);
        let keys: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if !keys.is_empty() && !opts.recursive {
            return Err(StorageError::Io {
                path: path.clone(),
                message: "refusing to delete directory without recursive".into(),
                source: None,
            });
        }
        for key in keys {
            files.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn behaves_like_a_file_tree() {
        let s = MemoryStorage::new();
        let path = StoragePath::from("m1/current.json");
        s.write(&path, b"{}", WriteOptions::default()).await.unwrap();
        assert!(s.file_exists(&path).await.unwrap());
        assert!(s.directory_exists(&StoragePath::from("m1")).await.unwrap());
        assert!(!s.directory_exists(&StoragePath::from("m2")).await.unwrap());
        assert_eq!(s.read_to_string(&path).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn append_and_list() {
        let s = MemoryStorage::new();
        s.append(&StoragePath::from("m1/events/inputs.log"), b"a\n")
            .await
            .unwrap();
        s.append(&StoragePath::from("m1/events/inputs.log"), b"b\n")
            .await
            .unwrap();
        s.write(
            &StoragePath::from("m1/blobs/ab/cd.png"),
            b"img",
            WriteOptions::default(),
        )
        .await
        .unwrap();

        let shallow = s
            .list(&StoragePath::from("m1"), ListOptions::default())
            .await
            .unwrap();
        assert!(shallow.iter().all(|e| e.kind == EntryKind::Dir));
        assert_eq!(shallow.len(), 2);

        let deep = s
            .list(&StoragePath::from("m1"), ListOptions { deep: true })
            .await
            .unwrap();
        let files = deep.iter().filter(|e| e.kind == EntryKind::File).count();
        assert_eq!(files, 2);
    }

    #[tokio::test]
    async fn recursive_delete() {
        let s = MemoryStorage::new();
        s.write(&StoragePath::from("m1/a"), b"1", WriteOptions::default())
            .await
            .unwrap();
        s.write(&StoragePath::from("m1/b/c"), b"2", WriteOptions::default())
            .await
            .unwrap();
        s.delete(&StoragePath::from("m1"), DeleteOptions { recursive: true })
            .await
            .unwrap();
        assert_eq!(s.file_count().await, 0);
    }
}
