// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reelforge: a content-addressed, incremental build engine for
//! multi-stage generative-media pipelines.
//!
//! A user declares a blueprint (a typed dataflow graph of producers),
//! provides inputs, and the engine computes a minimal execution plan, runs
//! it with bounded concurrency, persists every produced artefact by
//! content hash, and records each step in an append-only event log.
//!
//! This crate wires the member crates into an [`Engine`] facade. Each
//! concern also stands alone: `rf-blueprint` (model + validator),
//! `rf-planner` (dirty detection and plan emission), `rf-runtime` (layered
//! executor), `rf-storage`/`rf-blob`/`rf-events`/`rf-manifest` (state), and
//! `rf-recovery` (provider-side adoption of completed requests).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use rf_blueprint::{validate, Blueprint, ValidationResult};
pub use rf_core::{Clock, InputValue, Manifest, MovieMetadata, Plan, SystemClock, ENGINE_VERSION};
pub use rf_error::{EngineError, ErrorCode};
pub use rf_handler::{Handler, HandlerRegistry};
pub use rf_planner::{PlanExplanation, PlanOptions, PlanOutcome};
pub use rf_recovery::{Fetcher, HttpFetcher, ProbeStatus, RecoveryReport, StatusProbe};
pub use rf_runtime::{ExecuteOptions, RunReport};

use rf_blob::BlobError;
use rf_events::{EventLog, EventLogError};
use rf_manifest::{ManifestError, ManifestService};
use rf_movie::{MovieError, MovieStore, MovieSummary};
use rf_planner::{Planner, PlannerError, PlanStoreError};
use rf_recovery::{Recovery, RecoveryError};
use rf_runtime::{Runtime, RuntimeError};
use rf_storage::{Storage, StorageContext, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// The services bundle behind the facade: storage, event log, manifest
/// service, handler registry, and clock, wired once and shared by the
/// planner and runtime.
#[derive(Clone)]
pub struct Services {
    ctx: StorageContext,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Services {
    /// Wire a services bundle over a storage backend.
    pub fn new(
        backend: Arc<dyn Storage>,
        base_path: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ctx: StorageContext::new(backend, base_path.into()),
            registry,
            clock,
        }
    }

    /// The storage context all services resolve paths through.
    pub fn storage(&self) -> &StorageContext {
        &self.ctx
    }
}

/// Aggregated result of fanning [`Handler::warm_start`] across the
/// registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmStartReport {
    /// Keys whose handlers reported ready.
    pub ready: Vec<(String, String, String)>,
    /// Keys whose handlers failed, with the failure message.
    pub failures: Vec<((String, String, String), String)>,
}

impl WarmStartReport {
    /// `true` when every handler is ready.
    pub fn is_ready(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The engine facade.
pub struct Engine {
    services: Services,
    movies: MovieStore,
    planner: Planner,
    runtime: Runtime,
    manifest: ManifestService,
    events: EventLog,
    recovery: Option<Recovery>,
}

impl Engine {
    /// Build an engine over a services bundle.
    pub fn new(services: Services) -> Self {
        let ctx = services.ctx.clone();
        Self {
            movies: MovieStore::new(ctx.clone(), services.clock.clone()),
            planner: Planner::new(ctx.clone(), services.clock.clone()),
            runtime: Runtime::new(ctx.clone(), services.registry.clone(), services.clock.clone()),
            manifest: ManifestService::new(ctx.clone()),
            events: EventLog::new(ctx),
            recovery: None,
            services,
        }
    }

    /// Enable the recovery pre-pass with an injected probe and fetcher.
    #[must_use]
    pub fn with_recovery(
        mut self,
        probe: Arc<dyn StatusProbe>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        self.recovery = Some(Recovery::new(
            self.services.ctx.clone(),
            probe,
            fetcher,
            self.services.clock.clone(),
        ));
        self
    }

    /// Engine version string.
    pub fn version(&self) -> &'static str {
        ENGINE_VERSION
    }

    // -- movie lifecycle ----------------------------------------------------

    /// Initialize a movie.
    pub async fn init_movie(
        &self,
        movie_id: &str,
        display_name: Option<String>,
    ) -> EngineResult<MovieMetadata> {
        self.movies
            .init(movie_id, display_name)
            .await
            .map_err(movie_error)
    }

    /// Delete a movie and everything under it.
    pub async fn delete_movie(&self, movie_id: &str) -> EngineResult<()> {
        self.movies.delete(movie_id).await.map_err(movie_error)
    }

    /// List movies with their metadata.
    pub async fn list_movies(&self) -> EngineResult<Vec<MovieSummary>> {
        self.movies.list().await.map_err(movie_error)
    }

    /// Read a movie's metadata.
    pub async fn movie_metadata(&self, movie_id: &str) -> EngineResult<MovieMetadata> {
        self.movies.metadata(movie_id).await.map_err(movie_error)
    }

    /// Load a movie's current manifest.
    pub async fn current_manifest(&self, movie_id: &str) -> EngineResult<Manifest> {
        self.manifest.load(movie_id).await.map_err(manifest_error)
    }

    // -- planning and execution ---------------------------------------------

    /// Run the recovery pre-pass (when configured), then compute, persist,
    /// and explain a plan.
    pub async fn plan(
        &self,
        movie_id: &str,
        blueprint: &Blueprint,
        inputs: &BTreeMap<String, InputValue>,
        options: &PlanOptions,
    ) -> EngineResult<PlanOutcome> {
        if let Some(recovery) = &self.recovery {
            let report = recovery.run(movie_id).await.map_err(recovery_error)?;
            if !report.adopted.is_empty() {
                info!(
                    target: "rf.engine",
                    movie_id,
                    adopted = report.adopted.len(),
                    "recovery pre-pass adopted completed outputs"
                );
            }
        }
        self.planner
            .plan(movie_id, blueprint, inputs, options)
            .await
            .map_err(planner_error)
    }

    /// Execute a previously emitted plan.
    pub async fn execute(
        &self,
        movie_id: &str,
        plan: &Plan,
        options: &ExecuteOptions,
    ) -> EngineResult<RunReport> {
        self.runtime
            .execute(movie_id, plan, options)
            .await
            .map_err(runtime_error)
    }

    /// Load a persisted plan by revision, or the latest one.
    pub async fn load_plan(&self, movie_id: &str, revision: Option<&str>) -> EngineResult<Plan> {
        let store = self.planner.plan_store();
        match revision {
            Some(revision) => store.load(movie_id, revision).await,
            None => store.latest(movie_id).await,
        }
        .map_err(plan_store_error)
    }

    /// Run the recovery pre-pass on demand.
    pub async fn recover(&self, movie_id: &str) -> EngineResult<RecoveryReport> {
        match &self.recovery {
            Some(recovery) => recovery.run(movie_id).await.map_err(recovery_error),
            None => Ok(RecoveryReport::default()),
        }
    }

    /// Fan `warm_start` across every registered handler.
    pub async fn warm_start(&self) -> WarmStartReport {
        let mut report = WarmStartReport::default();
        for (key, handler) in self.services.registry.handlers() {
            match handler.warm_start().await {
                Ok(()) => report.ready.push(key.clone()),
                Err(err) => report.failures.push((key.clone(), format!("{err:#}"))),
            }
        }
        report.ready.sort();
        report.failures.sort();
        report
    }

    /// Event-log statistics for a movie.
    pub async fn event_stats(&self, movie_id: &str) -> EngineResult<rf_events::EventLogStats> {
        self.events.stats(movie_id).await.map_err(event_error)
    }
}

// -- error mapping ----------------------------------------------------------

fn movie_error(err: MovieError) -> EngineError {
    match err {
        MovieError::InvalidMovieId(id) => {
            EngineError::new(ErrorCode::InvalidMovieId, format!("invalid movie id `{id}`"))
        }
        MovieError::MovieNotFound(id) => {
            EngineError::new(ErrorCode::MovieNotFound, format!("movie `{id}` not found"))
        }
        MovieError::AlreadyExists(id) => EngineError::new(
            ErrorCode::InvalidMovieId,
            format!("movie `{id}` already exists"),
        )
        .detail("reason", "already_exists"),
        MovieError::Manifest(err) => manifest_error(err),
        MovieError::Storage(err) => storage_error(err),
    }
}

fn manifest_error(err: ManifestError) -> EngineError {
    match err {
        ManifestError::NotInitialized(id) => EngineError::new(
            ErrorCode::MovieNotFound,
            format!("movie `{id}` is not initialized"),
        ),
        ManifestError::Corrupt { path, message } => {
            EngineError::new(ErrorCode::ManifestCorrupt, message).detail("path", path)
        }
        ManifestError::Events(err) => event_error(err),
        ManifestError::Storage(err) => storage_error(err),
    }
}

fn event_error(err: EventLogError) -> EngineError {
    match err {
        EventLogError::Corrupt {
            path,
            line,
            message,
        } => EngineError::new(ErrorCode::ManifestCorrupt, message)
            .detail("path", path)
            .detail("line", line),
        EventLogError::Storage(err) => storage_error(err),
    }
}

fn storage_error(err: StorageError) -> EngineError {
    match &err {
        StorageError::Corrupt { path, message } => {
            let path = path.as_str().to_string();
            EngineError::new(ErrorCode::ManifestCorrupt, message.clone())
                .detail("path", path)
        }
        _ => EngineError::new(ErrorCode::StorageUnavailable, err.to_string()).caused_by(err),
    }
}

fn blob_error(err: BlobError) -> EngineError {
    match err {
        BlobError::NotFound(hash) => {
            EngineError::new(ErrorCode::BlobNotFound, format!("blob `{hash}` not found"))
                .detail("hash", hash)
        }
        BlobError::Storage(err) => storage_error(err),
    }
}

fn planner_error(err: PlannerError) -> EngineError {
    match err {
        PlannerError::Validation(_)
        | PlannerError::BadCount { .. }
        | PlannerError::BadCondition { .. }
        | PlannerError::UnresolvableProducer { .. }
        | PlannerError::UnknownTarget { .. } => {
            EngineError::new(ErrorCode::PlanValidationFailed, err.to_string())
        }
        PlannerError::Manifest(err) => manifest_error(err),
        PlannerError::Events(err) => event_error(err),
        PlannerError::Blob(err) => blob_error(err),
        PlannerError::PlanStore(err) => plan_store_error(err),
        PlannerError::Storage(err) => storage_error(err),
    }
}

fn plan_store_error(err: PlanStoreError) -> EngineError {
    match err {
        PlanStoreError::NotFound { movie_id, revision } => EngineError::new(
            ErrorCode::PlanNotFound,
            format!("no plan for movie `{movie_id}` revision `{revision}`"),
        ),
        PlanStoreError::Corrupt { path, message } => {
            EngineError::new(ErrorCode::ManifestCorrupt, message).detail("path", path)
        }
        PlanStoreError::Storage(err) => storage_error(err),
    }
}

fn runtime_error(err: RuntimeError) -> EngineError {
    match err {
        RuntimeError::Manifest(err) => manifest_error(err),
        RuntimeError::Events(err) => event_error(err),
        RuntimeError::Blob(err) => blob_error(err),
        RuntimeError::Storage(err) => storage_error(err),
        RuntimeError::Join(message) => EngineError::new(ErrorCode::Internal, message),
    }
}

fn recovery_error(err: RecoveryError) -> EngineError {
    match err {
        RecoveryError::Manifest(err) => manifest_error(err),
        RecoveryError::Events(err) => event_error(err),
        RecoveryError::Blob(err) => blob_error(err),
        RecoveryError::Storage(err) => storage_error(err),
    }
}
