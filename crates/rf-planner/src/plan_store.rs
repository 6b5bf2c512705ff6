// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence of emitted plans under `runs/<revision>-plan.json`.

use rf_core::{revision_number, Plan};
use rf_storage::{EntryKind, ListOptions, Storage, StorageContext, StorageError, StoragePath};
use thiserror::Error;

const RUNS_DIR: &str = "runs";

/// Errors surfaced by the plan store.
#[derive(Debug, Error)]
pub enum PlanStoreError {
    /// No plan is persisted for the requested revision.
    #[error("no plan found for movie `{movie_id}` revision `{revision}`")]
    NotFound {
        /// Movie id.
        movie_id: String,
        /// Requested revision, or `*` for "latest".
        revision: String,
    },

    /// A plan file failed to parse.
    #[error("corrupt plan at `{path}`: {message}")]
    Corrupt {
        /// Offending path.
        path: String,
        /// Parse failure description.
        message: String,
    },

    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Reads and writes persisted plans.
#[derive(Clone)]
pub struct PlanStore {
    ctx: StorageContext,
}

impl PlanStore {
    /// Create a store over the given storage context.
    pub fn new(ctx: StorageContext) -> Self {
        Self { ctx }
    }

    fn plan_path(&self, movie_id: &str, revision: &str) -> StoragePath {
        self.ctx
            .resolve(movie_id, [RUNS_DIR, &format!("{revision}-plan.json")])
    }

    /// Persist a plan under its revision.
    pub async fn save(&self, movie_id: &str, plan: &Plan) -> Result<(), PlanStoreError> {
        let path = self.plan_path(movie_id, &plan.revision);
        self.ctx.write_json(&path, plan).await?;
        Ok(())
    }

    /// Load the plan persisted for a revision.
    pub async fn load(&self, movie_id: &str, revision: &str) -> Result<Plan, PlanStoreError> {
        let path = self.plan_path(movie_id, revision);
        match self.ctx.read_json::<Plan>(&path).await {
            Ok(plan) => Ok(plan),
            Err(StorageError::NotFound(_)) => Err(PlanStoreError::NotFound {
                movie_id: movie_id.to_string(),
                revision: revision.to_string(),
            }),
            Err(StorageError::Corrupt { path, message }) => Err(PlanStoreError::Corrupt {
                path: path.as_str().to_string(),
                message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the plan with the highest revision number.
    pub async fn latest(&self, movie_id: &str) -> Result<Plan, PlanStoreError> {
        let dir = self.ctx.resolve(movie_id, [RUNS_DIR]);
        let entries = self
            .ctx
            .backend()
            .list(&dir, ListOptions::default())
            .await?;
        let mut best: Option<(u32, String)> = None;
        for entry in entries {
            if entry.kind != EntryKind::File {
                continue;
            }
            let Some(name) = entry.path.file_name() else {
                continue;
            };
            let Some(revision) = name.strip_suffix("-plan.json") else {
                continue;
            };
            if let Some(n) = revision_number(revision) {
                if best.as_ref().is_none_or(|(b, _)| n > *b) {
                    best = Some((n, revision.to_string()));
                }
            }
        }
        match best {
            Some((_, revision)) => self.load(movie_id, &revision).await,
            None => Err(PlanStoreError::NotFound {
                movie_id: movie_id.to_string(),
                revision: "*".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rf_storage::MemoryStorage;
    use std::sync::Arc;

    fn store() -> PlanStore {
        PlanStore::new(StorageContext::new(Arc::new(MemoryStorage::new()), "movies"))
    }

    fn plan(revision: &str) -> Plan {
        Plan {
            revision: revision.into(),
            manifest_base_hash: None,
            blueprint_layer_count: 1,
            layers: vec![],
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn save_load_round_trips() {
        let store = store();
        store.save("m1", &plan("rev-0001")).await.unwrap();
        let loaded = store.load("m1", "rev-0001").await.unwrap();
        assert_eq!(loaded.revision, "rev-0001");
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let store = store();
        assert!(matches!(
            store.load("m1", "rev-0001").await,
            Err(PlanStoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.latest("m1").await,
            Err(PlanStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn latest_picks_highest_revision() {
        let store = store();
        store.save("m1", &plan("rev-0001")).await.unwrap();
        store.save("m1", &plan("rev-0003")).await.unwrap();
        store.save("m1", &plan("rev-0002")).await.unwrap();
        let latest = store.latest("m1").await.unwrap();
        assert_eq!(latest.revision, "rev-0003");
    }
}
