// SPDX-License-Identifier: MIT OR Apache-2.0
//! Movie lifecycle.
//!
//! A movie is a single run-space on storage: its event log, manifests,
//! plans, blobs, and metadata all live under `<basePath>/<movieId>/`.
//! Initialization writes the storage skeleton and the empty current
//! pointer; deletion is whole-build teardown.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rf_core::{Clock, MovieMetadata, ENGINE_VERSION};
use rf_manifest::{ManifestError, ManifestService};
use rf_storage::{DeleteOptions, EntryKind, ListOptions, Storage, StorageContext, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

const METADATA_FILE: &str = "metadata.json";
/// Read-compatible fallback written by earlier layouts.
const LEGACY_METADATA_FILE: &str = "movie-metadata.json";

/// Errors surfaced by the movie store.
#[derive(Debug, Error)]
pub enum MovieError {
    /// The identifier does not match the allowed grammar.
    #[error("invalid movie id `{0}`")]
    InvalidMovieId(String),

    /// No movie exists under the identifier.
    #[error("movie `{0}` not found")]
    MovieNotFound(String),

    /// A movie already exists under the identifier.
    #[error("movie `{0}` already exists")]
    AlreadyExists(String),

    /// Manifest service failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A listed movie.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieSummary {
    /// Movie identifier (its directory name).
    pub movie_id: String,
    /// Metadata, when readable.
    pub metadata: Option<MovieMetadata>,
}

/// Validate a movie identifier: lowercase alphanumerics and dashes,
/// starting with an alphanumeric, at most 64 characters.
pub fn validate_movie_id(movie_id: &str) -> Result<(), MovieError> {
    let valid = !movie_id.is_empty()
        && movie_id.len() <= 64
        && movie_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && movie_id
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(MovieError::InvalidMovieId(movie_id.to_string()))
    }
}

/// Generate a fresh movie identifier.
pub fn generate_movie_id() -> String {
    format!("movie-{}", uuid::Uuid::new_v4().simple())
}

/// Lifecycle operations over all movies under a storage context.
#[derive(Clone)]
pub struct MovieStore {
    ctx: StorageContext,
    manifest: ManifestService,
    clock: Arc<dyn Clock>,
}

impl MovieStore {
    /// Create a store over a storage context and clock.
    pub fn new(ctx: StorageContext, clock: Arc<dyn Clock>) -> Self {
        Self {
            manifest: ManifestService::new(ctx.clone()),
            ctx,
            clock,
        }
    }

    /// Whether the movie's skeleton exists.
    pub async fn exists(&self, movie_id: &str) -> Result<bool, MovieError> {
        let pointer = self.ctx.resolve(movie_id, ["current.json"]);
        Ok(self.ctx.backend().file_exists(&pointer).await?)
    }

    /// Initialize a movie: storage skeleton, empty current pointer, and
    /// metadata.
    pub async fn init(
        &self,
        movie_id: &str,
        display_name: Option<String>,
    ) -> Result<MovieMetadata, MovieError> {
        validate_movie_id(movie_id)?;
        if self.exists(movie_id).await? {
            return Err(MovieError::AlreadyExists(movie_id.to_string()));
        }
        let now = self.clock.now();
        self.manifest.init_pointer(movie_id, now).await?;
        let metadata = MovieMetadata {
            display_name,
            created_at: Some(now),
            engine_version: Some(ENGINE_VERSION.to_string()),
            ..MovieMetadata::default()
        };
        self.write_metadata(movie_id, &metadata).await?;
        info!(target: "rf.movie", movie_id, "movie initialized");
        Ok(metadata)
    }

    /// Tear down a movie and everything under it. Blobs are only ever
    /// deleted here.
    pub async fn delete(&self, movie_id: &str) -> Result<(), MovieError> {
        validate_movie_id(movie_id)?;
        if !self.exists(movie_id).await? {
            return Err(MovieError::MovieNotFound(movie_id.to_string()));
        }
        let root = self.ctx.resolve(movie_id, Vec::<&str>::new());
        self.ctx
            .backend()
            .delete(&root, DeleteOptions { recursive: true })
            .await?;
        info!(target: "rf.movie", movie_id, "movie deleted");
        Ok(())
    }

    /// List movies under the base path, sorted by id.
    pub async fn list(&self) -> Result<Vec<MovieSummary>, MovieError> {
        let base = self.ctx.resolve_base(Vec::<&str>::new());
        let entries = self
            .ctx
            .backend()
            .list(&base, ListOptions::default())
            .await?;
        let mut summaries = Vec::new();
        for entry in entries {
            if entry.kind != EntryKind::Dir {
                continue;
            }
            let Some(movie_id) = entry.path.file_name().map(str::to_string) else {
                continue;
            };
            let metadata = self.metadata(&movie_id).await.ok();
            summaries.push(MovieSummary { movie_id, metadata });
        }
        summaries.sort_by(|a, b| a.movie_id.cmp(&b.movie_id));
        Ok(summaries)
    }

    /// Read a movie's metadata, falling back to the legacy filename.
    pub async fn metadata(&self, movie_id: &str) -> Result<MovieMetadata, MovieError> {
        for file in [METADATA_FILE, LEGACY_METADATA_FILE] {
            let path = self.ctx.resolve(movie_id, [file]);
            match self.ctx.read_json::<MovieMetadata>(&path).await {
                Ok(metadata) => return Ok(metadata),
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(MovieError::MovieNotFound(movie_id.to_string()))
    }

    async fn write_metadata(
        &self,
        movie_id: &str,
        metadata: &MovieMetadata,
    ) -> Result<(), MovieError> {
        let path = self.ctx.resolve(movie_id, [METADATA_FILE]);
        self.ctx.write_json(&path, metadata).await?;
        Ok(())
    }

    /// Update the display name.
    pub async fn set_display_name(
        &self,
        movie_id: &str,
        display_name: impl Into<String>,
    ) -> Result<MovieMetadata, MovieError> {
        let mut metadata = self.metadata(movie_id).await?;
        metadata.display_name = Some(display_name.into());
        self.write_metadata(movie_id, &metadata).await?;
        Ok(metadata)
    }

    /// Record the blueprint and inputs paths last used for planning.
    pub async fn touch_paths(
        &self,
        movie_id: &str,
        blueprint_path: Option<String>,
        last_inputs_path: Option<String>,
    ) -> Result<MovieMetadata, MovieError> {
        let mut metadata = self.metadata(movie_id).await?;
        if blueprint_path.is_some() {
            metadata.blueprint_path = blueprint_path;
        }
        if last_inputs_path.is_some() {
            metadata.last_inputs_path = last_inputs_path;
        }
        self.write_metadata(movie_id, &metadata).await?;
        Ok(metadata)
    }

    /// Creation timestamp helper used by list surfaces.
    pub async fn created_at(&self, movie_id: &str) -> Result<Option<DateTime<Utc>>, MovieError> {
        Ok(self.metadata(movie_id).await?.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rf_core::FixedClock;
    use rf_storage::{MemoryStorage, Storage, StoragePath, WriteOptions};

    fn store() -> (StorageContext, MovieStore) {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        let clock = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        ));
        (ctx.clone(), MovieStore::new(ctx, clock))
    }

    #[test]
    fn id_validation() {
        assert!(validate_movie_id("trailer-042").is_ok());
        assert!(validate_movie_id("a").is_ok());
        assert!(validate_movie_id("").is_err());
        assert!(validate_movie_id("-leading-dash").is_err());
        assert!(validate_movie_id("Uppercase").is_err());
        assert!(validate_movie_id("has space").is_err());
        assert!(validate_movie_id(&"x".repeat(65)).is_err());
        assert!(validate_movie_id(&generate_movie_id()).is_ok());
    }

    #[tokio::test]
    async fn init_writes_skeleton_and_metadata() {
        let (_ctx, store) = store();
        let metadata = store.init("m1", Some("Trailer".into())).await.unwrap();
        assert_eq!(metadata.display_name.as_deref(), Some("Trailer"));
        assert_eq!(metadata.engine_version.as_deref(), Some(ENGINE_VERSION));
        assert!(store.exists("m1").await.unwrap());
        // Double init is rejected.
        assert!(matches!(
            store.init("m1", None).await,
            Err(MovieError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let (_ctx, store) = store();
        assert!(matches!(
            store.init("Bad Id", None).await,
            Err(MovieError::InvalidMovieId(_))
        ));
    }

    #[tokio::test]
    async fn delete_tears_down_everything() {
        let (ctx, store) = store();
        store.init("m1", None).await.unwrap();
        ctx.backend()
            .write(
                &ctx.resolve("m1", ["blobs", "ab", "abc.png"]),
                b"img",
                WriteOptions::default(),
            )
            .await
            .unwrap();
        store.delete("m1").await.unwrap();
        assert!(!store.exists("m1").await.unwrap());
        assert!(!ctx
            .backend()
            .directory_exists(&StoragePath::from("movies/m1"))
            .await
            .unwrap());
        assert!(matches!(
            store.delete("m1").await,
            Err(MovieError::MovieNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_returns_sorted_summaries() {
        let (_ctx, store) = store();
        store.init("bbb", None).await.unwrap();
        store.init("aaa", Some("First".into())).await.unwrap();
        let movies = store.list().await.unwrap();
        let ids: Vec<&str> = movies.iter().map(|m| m.movie_id.as_str()).collect();
        assert_eq!(ids, ["aaa", "bbb"]);
        assert_eq!(
            movies[0].metadata.as_ref().unwrap().display_name.as_deref(),
            Some("First")
        );
    }

    #[tokio::test]
    async fn legacy_metadata_filename_is_read_compatible() {
        let (ctx, store) = store();
        store.init("m1", None).await.unwrap();
        // Simulate an old layout: move metadata to the legacy name.
        let new_path = ctx.resolve("m1", ["metadata.json"]);
        let bytes = ctx.backend().read_to_bytes(&new_path).await.unwrap();
        ctx.backend()
            .delete(&new_path, DeleteOptions::default())
            .await
            .unwrap();
        ctx.backend()
            .write(
                &ctx.resolve("m1", ["movie-metadata.json"]),
                &bytes,
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let metadata = store.metadata("m1").await.unwrap();
        assert_eq!(metadata.engine_version.as_deref(), Some(ENGINE_VERSION));
    }

    #[tokio::test]
    async fn metadata_updates() {
        let (_ctx, store) = store();
        store.init("m1", None).await.unwrap();
        store.set_display_name("m1", "Renamed").await.unwrap();
        let metadata = store
            .touch_paths("m1", Some("bp.yaml".into()), Some("inputs.json".into()))
            .await
            .unwrap();
        assert_eq!(metadata.display_name.as_deref(), Some("Renamed"));
        assert_eq!(metadata.blueprint_path.as_deref(), Some("bp.yaml"));
        assert_eq!(metadata.last_inputs_path.as_deref(), Some("inputs.json"));
    }
}
