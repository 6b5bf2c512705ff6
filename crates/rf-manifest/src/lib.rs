// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest service.
//!
//! The manifest is derived state: replaying every event in order and
//! keeping the last event per canonical id reconstructs it exactly. This
//! crate materializes snapshots to `manifests/rev-NNNN.json` and maintains
//! the `current.json` pointer, which is swapped atomically so readers
//! always dereference a consistent snapshot.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rf_core::{next_revision, CurrentPointer, Event, Manifest};
use rf_events::{EventLog, EventLogError};
use rf_storage::{StorageContext, StorageError, StoragePath};
use thiserror::Error;
use tracing::{debug, info};

const CURRENT_POINTER: &str = "current.json";
const MANIFESTS_DIR: &str = "manifests";

/// Errors surfaced by the manifest service.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The movie has no storage skeleton (`current.json` missing).
    #[error("movie `{0}` is not initialized")]
    NotInitialized(String),

    /// A manifest or pointer file failed to parse.
    #[error("corrupt manifest state at `{path}`: {message}")]
    Corrupt {
        /// Offending path.
        path: String,
        /// Parse failure description.
        message: String,
    },

    /// The event log failed.
    #[error(transparent)]
    Events(#[from] EventLogError),

    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Materializes manifests and maintains the current pointer.
#[derive(Clone)]
pub struct ManifestService {
    ctx: StorageContext,
    log: EventLog,
}

impl ManifestService {
    /// Create a service over the given storage context.
    pub fn new(ctx: StorageContext) -> Self {
        let log = EventLog::new(ctx.clone());
        Self { ctx, log }
    }

    /// The event log this service replays.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    fn pointer_path(&self, movie_id: &str) -> StoragePath {
        self.ctx.resolve(movie_id, [CURRENT_POINTER])
    }

    fn manifest_path(&self, movie_id: &str, revision: &str) -> StoragePath {
        self.ctx
            .resolve(movie_id, [MANIFESTS_DIR, &format!("{revision}.json")])
    }

    /// Write the empty pointer for a freshly initialized movie.
    pub async fn init_pointer(
        &self,
        movie_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ManifestError> {
        let pointer = CurrentPointer {
            revision: None,
            manifest_path: None,
            hash: None,
            updated_at: at,
        };
        self.ctx
            .write_json(&self.pointer_path(movie_id), &pointer)
            .await?;
        Ok(())
    }

    /// Read the current pointer.
    pub async fn pointer(&self, movie_id: &str) -> Result<CurrentPointer, ManifestError> {
        let path = self.pointer_path(movie_id);
        match self.ctx.read_json::<CurrentPointer>(&path).await {
            Ok(pointer) => Ok(pointer),
            Err(StorageError::NotFound(_)) => {
                Err(ManifestError::NotInitialized(movie_id.to_string()))
            }
            Err(StorageError::Corrupt { path, message }) => Err(ManifestError::Corrupt {
                path: path.as_str().to_string(),
                message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the current manifest.
    ///
    /// A pointer with no manifest path (fresh movie) loads as an empty
    /// manifest with `revision = None`.
    pub async fn load(&self, movie_id: &str) -> Result<Manifest, ManifestError> {
        let pointer = self.pointer(movie_id).await?;
        let Some(rel_path) = pointer.manifest_path else {
            return Ok(Manifest::empty());
        };
        let path = self.ctx.resolve(movie_id, [rel_path.as_str()]);
        match self.ctx.read_json::<Manifest>(&path).await {
            Ok(manifest) => Ok(manifest),
            Err(StorageError::NotFound(_)) => Err(ManifestError::Corrupt {
                path: path.as_str().to_string(),
                message: "current pointer references a missing manifest".into(),
            }),
            Err(StorageError::Corrupt { path, message }) => Err(ManifestError::Corrupt {
                path: path.as_str().to_string(),
                message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// The revision the next materialization will be written under.
    pub async fn next_revision(&self, movie_id: &str) -> Result<String, ManifestError> {
        let pointer = self.pointer(movie_id).await?;
        Ok(next_revision(pointer.revision.as_deref()))
    }

    /// Rebuild the manifest purely from the event log.
    ///
    /// Replay determinism: this equals the incrementally materialized
    /// manifest for any split of the same event sequence.
    pub async fn materialize_from_log(&self, movie_id: &str) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::empty();
        let events = self.log.read_events(movie_id).await?;
        manifest.apply_all(events.iter());
        Ok(manifest)
    }

    /// Apply new events on top of the current manifest, write
    /// `manifests/<revision>.json`, and atomically swap `current.json`.
    ///
    /// `revision` may equal the current revision (extending it within one
    /// plan/execute cycle) or advance past it. The prior manifest's hash is
    /// carried as `manifest_base_hash` when the revision advances.
    pub async fn materialize(
        &self,
        movie_id: &str,
        revision: &str,
        new_events: &[Event],
        at: DateTime<Utc>,
    ) -> Result<Manifest, ManifestError> {
        let pointer = self.pointer(movie_id).await?;
        let mut manifest = self.load(movie_id).await?;

        let advancing = pointer.revision.as_deref() != Some(revision);
        if advancing {
            manifest.manifest_base_hash = pointer.hash.clone();
        }
        manifest.revision = Some(revision.to_string());
        manifest.apply_all(new_events.iter());

        let manifest_rel = format!("{MANIFESTS_DIR}/{revision}.json");
        let manifest_abs = self.manifest_path(movie_id, revision);
        self.ctx.write_json(&manifest_abs, &manifest).await?;

        let hash = manifest_hash(&manifest);
        let new_pointer = CurrentPointer {
            revision: Some(revision.to_string()),
            manifest_path: Some(manifest_rel),
            hash: Some(hash),
            updated_at: at,
        };
        self.ctx
            .write_json(&self.pointer_path(movie_id), &new_pointer)
            .await?;
        info!(
            target: "rf.manifest",
            movie_id,
            revision,
            events = new_events.len(),
            "manifest materialized and pointer swapped"
        );
        debug!(target: "rf.manifest", inputs = manifest.inputs.len(), artefacts = manifest.artefacts.len(), "snapshot sizes");
        Ok(manifest)
    }
}

/// Hash of a manifest's canonical serialization.
pub fn manifest_hash(manifest: &Manifest) -> String {
    let value = serde_json::to_value(manifest).expect("manifest serialization is infallible");
    rf_hash::hash_value(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rf_core::{ArtefactEvent, ArtefactOutput, ArtefactStatus, InputEvent};
    use rf_storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn service() -> ManifestService {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        ManifestService::new(ctx)
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn input_event(id: &str, hash: &str, revision: &str) -> Event {
        Event::Input(InputEvent {
            input_id: id.into(),
            hash: hash.into(),
            canonical: format!("\"{hash}\""),
            value: Some(serde_json::json!(hash)),
            value_blob_ref: None,
            revision: revision.into(),
            at: ts(),
        })
    }

    fn artefact_event(id: &str, revision: &str) -> Event {
        Event::Artefact(ArtefactEvent {
            artefact_id: id.into(),
            produced_by: "Producer:P".into(),
            inputs_hash: "ih".into(),
            output: ArtefactOutput::from_value(serde_json::json!("out")),
            status: ArtefactStatus::Succeeded,
            diagnostics: None,
            revision: revision.into(),
            at: ts(),
        })
    }

    #[tokio::test]
    async fn uninitialized_movie_errors() {
        let svc = service();
        assert!(matches!(
            svc.load("ghost").await,
            Err(ManifestError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn fresh_pointer_loads_empty_manifest() {
        let svc = service();
        svc.init_pointer("m1", ts()).await.unwrap();
        let manifest = svc.load("m1").await.unwrap();
        assert_eq!(manifest, Manifest::empty());
        assert_eq!(svc.next_revision("m1").await.unwrap(), "rev-0001");
    }

    #[tokio::test]
    async fn materialize_writes_snapshot_and_swaps_pointer() {
        let svc = service();
        svc.init_pointer("m1", ts()).await.unwrap();
        let events = vec![input_event("Input:Prompt", "h1", "rev-0001")];
        let manifest = svc.materialize("m1", "rev-0001", &events, ts()).await.unwrap();
        assert_eq!(manifest.revision.as_deref(), Some("rev-0001"));
        assert!(manifest.manifest_base_hash.is_none());

        let pointer = svc.pointer("m1").await.unwrap();
        assert_eq!(pointer.revision.as_deref(), Some("rev-0001"));
        assert_eq!(
            pointer.manifest_path.as_deref(),
            Some("manifests/rev-0001.json")
        );
        assert_eq!(pointer.hash.as_deref(), Some(manifest_hash(&manifest).as_str()));

        let loaded = svc.load("m1").await.unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn advancing_revision_carries_base_hash() {
        let svc = service();
        svc.init_pointer("m1", ts()).await.unwrap();
        let first = svc
            .materialize("m1", "rev-0001", &[input_event("Input:A", "h1", "rev-0001")], ts())
            .await
            .unwrap();
        let second = svc
            .materialize("m1", "rev-0002", &[input_event("Input:A", "h2", "rev-0002")], ts())
            .await
            .unwrap();
        assert_eq!(
            second.manifest_base_hash.as_deref(),
            Some(manifest_hash(&first).as_str())
        );
        assert_eq!(svc.next_revision("m1").await.unwrap(), "rev-0003");
    }

    #[tokio::test]
    async fn extending_same_revision_keeps_base_hash() {
        let svc = service();
        svc.init_pointer("m1", ts()).await.unwrap();
        svc.materialize("m1", "rev-0001", &[input_event("Input:A", "h1", "rev-0001")], ts())
            .await
            .unwrap();
        let extended = svc
            .materialize("m1", "rev-0001", &[artefact_event("Artifact:Out", "rev-0001")], ts())
            .await
            .unwrap();
        assert_eq!(extended.revision.as_deref(), Some("rev-0001"));
        assert!(extended.manifest_base_hash.is_none());
        assert!(extended.artefacts.contains_key("Artifact:Out"));
        assert!(extended.inputs.contains_key("Input:A"));
    }

    #[tokio::test]
    async fn replay_from_log_matches_incremental_materialization() {
        let svc = service();
        svc.init_pointer("m1", ts()).await.unwrap();
        let log = svc.event_log().clone();

        // Append through the log, materialize incrementally in two steps.
        let e1 = input_event("Input:A", "h1", "rev-0001");
        let e2 = artefact_event("Artifact:Out", "rev-0001");
        let e3 = input_event("Input:A", "h2", "rev-0002");
        for event in [&e1, &e2, &e3] {
            match event {
                Event::Input(ev) => log.append_input("m1", ev).await.unwrap(),
                Event::Artefact(ev) => log.append_artefact("m1", ev).await.unwrap(),
            }
        }
        svc.materialize("m1", "rev-0001", std::slice::from_ref(&e1), ts())
            .await
            .unwrap();
        svc.materialize("m1", "rev-0001", std::slice::from_ref(&e2), ts())
            .await
            .unwrap();
        let incremental = svc
            .materialize("m1", "rev-0002", std::slice::from_ref(&e3), ts())
            .await
            .unwrap();

        let replayed = svc.materialize_from_log("m1").await.unwrap();
        assert_eq!(replayed.inputs, incremental.inputs);
        assert_eq!(replayed.artefacts, incremental.artefacts);
    }

    #[tokio::test]
    async fn corrupt_pointer_is_fatal() {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        let svc = ManifestService::new(ctx.clone());
        ctx.backend()
            .write(
                &ctx.resolve("m1", ["current.json"]),
                b"{not json",
                rf_storage::WriteOptions::default(),
            )
            .await
            .unwrap();
        assert!(matches!(
            svc.pointer("m1").await,
            Err(ManifestError::Corrupt { .. })
        ));
    }
}
