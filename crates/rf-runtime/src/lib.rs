// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution runtime.
//!
//! Executes a persisted plan layer by layer: up to `concurrency` handler
//! invocations run in parallel within a layer, and the next layer begins
//! only after every job in the current one reaches a terminal state.
//! Outputs persist through the blob store, every production attempt is
//! recorded as an artefact event, and the manifest is materialized once
//! after the final layer.
//!
//! Failures do not propagate as errors: a failed job yields `failed`
//! artefact events and downstream jobs are skipped for this run (no events
//! are emitted for them). Only infrastructure failures abort the run.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rf_blob::{BlobError, BlobStore};
use rf_core::{
    job_inputs_hash, ArtefactEvent, ArtefactOutput, ArtefactStatus, Clock, Diagnostics, Event,
    Job, Manifest, Plan,
};
use rf_events::{EventLog, EventLogError};
use rf_handler::{
    CancelToken, Handler, HandlerRegistry, HandlerStatus, JobContext, ProducedArtefact,
    ProviderResult, ResolvedValue,
};
use rf_manifest::{ManifestError, ManifestService};
use rf_planner::{BUILTIN_PROVIDER, COLLECT_MODEL};
use rf_storage::{StorageContext, StorageError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default parallel handler invocations within a layer.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Errors that abort a run. Handler failures never appear here; they
/// become artefact events.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Manifest service failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Event log failure.
    #[error(transparent)]
    Events(#[from] EventLogError),

    /// Blob store failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A worker task panicked or was torn down.
    #[error("job task failed: {0}")]
    Join(String),
}

/// Options shaping one execution.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Parallel handler invocations within a layer.
    pub concurrency: usize,
    /// Deployment environment label used for handler resolution.
    pub environment: String,
    /// Cancellation signal; in-flight jobs observe it, later jobs skip.
    pub cancel: Option<CancelToken>,
    /// Deadline applied when a handler declares none.
    pub default_deadline: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            environment: "production".into(),
            cancel: None,
            default_deadline: None,
        }
    }
}

/// Terminal states per job after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Revision the run executed under.
    pub revision: String,
    /// Jobs whose artefacts all succeeded.
    pub succeeded: Vec<String>,
    /// Jobs that recorded failed artefact events.
    pub failed: Vec<String>,
    /// Jobs skipped because a dependency failed or the run was cancelled.
    pub skipped: Vec<String>,
    /// Artefact events appended during the run.
    pub artefact_events: usize,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
}

/// The plan executor.
#[derive(Clone)]
pub struct Runtime {
    ctx: StorageContext,
    manifest: ManifestService,
    events: EventLog,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Runtime {
    /// Create a runtime over a storage context, handler registry, and clock.
    pub fn new(
        ctx: StorageContext,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manifest: ManifestService::new(ctx.clone()),
            events: EventLog::new(ctx.clone()),
            registry,
            clock,
            ctx,
        }
    }

    /// Execute a plan to completion.
    pub async fn execute(
        &self,
        movie_id: &str,
        plan: &Plan,
        options: &ExecuteOptions,
    ) -> Result<RunReport, RuntimeError> {
        let started = self.clock.now();
        let blobs = BlobStore::new(self.ctx.clone(), movie_id);
        let mut manifest = self.manifest.load(movie_id).await?;
        let mut appended: Vec<Event> = Vec::new();
        let mut unavailable: BTreeSet<String> = BTreeSet::new();
        let mut report = RunReport {
            revision: plan.revision.clone(),
            ..RunReport::default()
        };
        let cancel = options
            .cancel
            .clone()
            .unwrap_or_else(CancelToken::never);

        info!(
            target: "rf.runtime",
            movie_id,
            revision = %plan.revision,
            jobs = plan.job_count(),
            layers = plan.layers.len(),
            concurrency = options.concurrency,
            "run started"
        );

        for (layer_index, layer) in plan.layers.iter().enumerate() {
            let snapshot = Arc::new(manifest.clone());
            let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
            let mut tasks: JoinSet<JobOutcome> = JoinSet::new();

            for job in layer {
                // Cancellation and failed dependencies skip the job without
                // emitting events; a later plan will pick it up again.
                if cancel.is_cancelled() {
                    report.skipped.push(job.job_id.clone());
                    unavailable.extend(job.produces.iter().cloned());
                    continue;
                }
                if job
                    .inputs
                    .iter()
                    .any(|input| unavailable.contains(input))
                {
                    debug!(target: "rf.runtime", job_id = %job.job_id, "skipped: dependency failed");
                    report.skipped.push(job.job_id.clone());
                    unavailable.extend(job.produces.iter().cloned());
                    continue;
                }

                let worker = JobWorker {
                    job: job.clone(),
                    layer_index,
                    revision: plan.revision.clone(),
                    snapshot: snapshot.clone(),
                    blobs: blobs.clone(),
                    events: self.events.clone(),
                    registry: self.registry.clone(),
                    clock: self.clock.clone(),
                    environment: options.environment.clone(),
                    default_deadline: options.default_deadline,
                    cancel: cancel.clone(),
                    movie_id: movie_id.to_string(),
                };
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    worker.run().await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.map_err(|e| RuntimeError::Join(e.to_string()))?;
                match outcome.error {
                    Some(infra) => return Err(infra),
                    None => {
                        for event in &outcome.events {
                            manifest.apply(&Event::Artefact(event.clone()));
                            appended.push(Event::Artefact(event.clone()));
                        }
                        report.artefact_events += outcome.events.len();
                        if outcome.failed {
                            unavailable.extend(outcome.produces.iter().cloned());
                            report.failed.push(outcome.job_id);
                        } else {
                            report.succeeded.push(outcome.job_id);
                        }
                    }
                }
            }
        }

        // One serialized materialization after the final layer.
        if !appended.is_empty() {
            self.manifest
                .materialize(movie_id, &plan.revision, &appended, self.clock.now())
                .await?;
        }
        report.succeeded.sort();
        report.failed.sort();
        report.skipped.sort();
        report.duration_ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;
        info!(
            target: "rf.runtime",
            movie_id,
            revision = %plan.revision,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            duration_ms = report.duration_ms,
            "run finished"
        );
        Ok(report)
    }
}

/// Everything one job task needs, owned so it can move into the task.
struct JobWorker {
    job: Job,
    layer_index: usize,
    revision: String,
    snapshot: Arc<Manifest>,
    blobs: BlobStore,
    events: EventLog,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    environment: String,
    default_deadline: Option<Duration>,
    cancel: CancelToken,
    movie_id: String,
}

/// Terminal result of one job task.
struct JobOutcome {
    job_id: String,
    produces: Vec<String>,
    events: Vec<ArtefactEvent>,
    failed: bool,
    /// Infrastructure failure that must abort the run.
    error: Option<RuntimeError>,
}

impl JobWorker {
    async fn run(self) -> JobOutcome {
        let job_id = self.job.job_id.clone();
        let produces = self.job.produces.clone();
        match self.try_run().await {
            Ok((events, failed)) => JobOutcome {
                job_id,
                produces,
                events,
                failed,
                error: None,
            },
            Err(infra) => JobOutcome {
                job_id,
                produces,
                events: Vec::new(),
                failed: true,
                error: Some(infra),
            },
        }
    }

    async fn try_run(&self) -> Result<(Vec<ArtefactEvent>, bool), RuntimeError> {
        // 1-2. Resolve bindings and stamp the expected inputs hash.
        let inputs_hash = match job_inputs_hash(&self.job.inputs, &self.snapshot) {
            Ok(hash) => hash,
            Err(missing) => {
                let diagnostics = Diagnostics {
                    provider: Some(self.job.provider.clone()),
                    model: Some(self.job.provider_model.clone()),
                    recoverable: Some(false),
                    message: Some(format!("unresolved binding: {missing}")),
                    ..Diagnostics::default()
                };
                let events = self.record_failure(String::new(), diagnostics).await?;
                return Ok((events, true));
            }
        };

        // Engine-evaluated collectors never touch the registry.
        if self.job.provider == BUILTIN_PROVIDER && self.job.provider_model == COLLECT_MODEL {
            let events = self.run_collector(&inputs_hash).await?;
            return Ok((events, false));
        }

        let bindings = match self.resolve_bindings().await? {
            Ok(bindings) => bindings,
            Err(message) => {
                let diagnostics = Diagnostics {
                    provider: Some(self.job.provider.clone()),
                    model: Some(self.job.provider_model.clone()),
                    recoverable: Some(false),
                    message: Some(message),
                    ..Diagnostics::default()
                };
                let events = self.record_failure(inputs_hash, diagnostics).await?;
                return Ok((events, true));
            }
        };

        // 3. Invoke the handler under its deadline.
        let Some(handler) = self.registry.resolve(
            &self.job.provider,
            &self.job.provider_model,
            &self.environment,
        ) else {
            let diagnostics = Diagnostics {
                provider: Some(self.job.provider.clone()),
                model: Some(self.job.provider_model.clone()),
                recoverable: Some(false),
                message: Some("no handler registered".into()),
                ..Diagnostics::default()
            };
            let events = self.record_failure(inputs_hash, diagnostics).await?;
            return Ok((events, true));
        };

        let ctx = JobContext {
            job_id: self.job.job_id.clone(),
            provider: self.job.provider.clone(),
            model: self.job.provider_model.clone(),
            revision: self.revision.clone(),
            layer_index: self.layer_index,
            attempt: self.job.attempt,
            inputs: self.job.inputs.clone(),
            produces: self.job.produces.clone(),
            bindings,
            provider_options: self.job.context.provider_options.clone(),
            environment: self.environment.clone(),
            extras: serde_json::Value::Null,
            cancel: self.cancel.clone(),
        };

        let deadline = handler.deadline().or(self.default_deadline);
        let invocation = invoke_with_deadline(handler, ctx, deadline).await;

        let result = match invocation {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ProviderResult::failed(Diagnostics {
                provider: Some(self.job.provider.clone()),
                model: Some(self.job.provider_model.clone()),
                recoverable: Some(false),
                message: Some(format!("{err:#}")),
                ..Diagnostics::default()
            }),
            // Deadline expiry is recoverable: the provider may still finish
            // the request, and the recovery pre-pass can adopt it later.
            Err(_elapsed) => ProviderResult::failed(Diagnostics {
                provider: Some(self.job.provider.clone()),
                model: Some(self.job.provider_model.clone()),
                recoverable: Some(true),
                message: Some("handler deadline exceeded".into()),
                ..Diagnostics::default()
            }),
        };

        // 4-5. Persist outputs and append one event per artefact.
        match result.status {
            HandlerStatus::Succeeded => {
                let events = self.record_success(&inputs_hash, result).await?;
                Ok((events, false))
            }
            HandlerStatus::Failed => {
                let mut diagnostics = result.diagnostics.unwrap_or_default();
                diagnostics.provider.get_or_insert(self.job.provider.clone());
                diagnostics
                    .model
                    .get_or_insert(self.job.provider_model.clone());
                warn!(
                    target: "rf.runtime",
                    job_id = %self.job.job_id,
                    message = diagnostics.message.as_deref().unwrap_or("unknown"),
                    "handler failed"
                );
                let events = self.record_failure(inputs_hash, diagnostics).await?;
                Ok((events, true))
            }
        }
    }

    /// Fetch every consumed value from the manifest and blob store.
    ///
    /// The outer error is infrastructure; the inner `Err(String)` is a job
    /// failure (missing value) that becomes a failed artefact event.
    async fn resolve_bindings(
        &self,
    ) -> Result<Result<BTreeMap<String, ResolvedValue>, String>, RuntimeError> {
        let mut bindings = BTreeMap::new();
        for (port, canonical_id) in &self.job.context.input_bindings {
            match self.resolve_one(canonical_id).await? {
                Some(resolved) => {
                    bindings.insert(port.clone(), resolved);
                }
                None => {
                    return Ok(Err(format!("no value available for `{canonical_id}`")));
                }
            }
        }
        Ok(Ok(bindings))
    }

    async fn resolve_one(
        &self,
        canonical_id: &str,
    ) -> Result<Option<ResolvedValue>, RuntimeError> {
        if let Some(input) = self.snapshot.inputs.get(canonical_id) {
            if let Some(value) = &input.value {
                return Ok(Some(ResolvedValue::Scalar(value.clone())));
            }
            if let Some(blob_ref) = &input.value_blob_ref {
                let bytes = self.blobs.read(blob_ref).await?;
                return Ok(Some(ResolvedValue::Blob {
                    blob_ref: blob_ref.clone(),
                    bytes,
                }));
            }
            return Ok(None);
        }
        if let Some(artefact) = self.snapshot.artefacts.get(canonical_id) {
            if !artefact.is_succeeded() {
                return Ok(None);
            }
            if let Some(value) = &artefact.value {
                return Ok(Some(ResolvedValue::Scalar(value.clone())));
            }
            if let Some(blob_ref) = &artefact.blob {
                let bytes = self.blobs.read(blob_ref).await?;
                return Ok(Some(ResolvedValue::Blob {
                    blob_ref: blob_ref.clone(),
                    bytes,
                }));
            }
        }
        Ok(None)
    }

    /// Evaluate a collector: gather every consumed index in order into one
    /// list-valued artefact.
    async fn run_collector(
        &self,
        inputs_hash: &str,
    ) -> Result<Vec<ArtefactEvent>, RuntimeError> {
        // Lexicographic input order would put `[10]` before `[2]`; order by
        // the parsed index instead.
        let mut indexed: Vec<(u64, &String)> = self
            .job
            .inputs
            .iter()
            .map(|id| {
                let index = match rf_id::parse(id) {
                    Ok(rf_id::CanonicalId::Artifact(a)) => match a.selector {
                        Some(rf_id::LoopSelector::Const(i)) => i,
                        _ => 0,
                    },
                    _ => 0,
                };
                (index, id)
            })
            .collect();
        indexed.sort();

        let mut items = Vec::with_capacity(indexed.len());
        for (_, id) in indexed {
            let item = match self.snapshot.artefacts.get(id) {
                Some(state) if state.is_succeeded() => match (&state.value, &state.blob) {
                    (Some(value), _) => value.clone(),
                    (None, Some(blob_ref)) => blob_ref.canonical_triple(),
                    (None, None) => serde_json::Value::Null,
                },
                _ => serde_json::Value::Null,
            };
            items.push(item);
        }
        let output = ArtefactOutput::from_value(serde_json::Value::Array(items));
        let mut events = Vec::new();
        for produced in &self.job.produces {
            let event = ArtefactEvent {
                artefact_id: produced.clone(),
                produced_by: self.job.job_id.clone(),
                inputs_hash: inputs_hash.to_string(),
                output: output.clone(),
                status: ArtefactStatus::Succeeded,
                diagnostics: None,
                revision: self.revision.clone(),
                at: self.clock.now(),
            };
            self.events.append_artefact(&self.movie_id, &event).await?;
            events.push(event);
        }
        Ok(events)
    }

    async fn record_success(
        &self,
        inputs_hash: &str,
        result: ProviderResult,
    ) -> Result<Vec<ArtefactEvent>, RuntimeError> {
        let mut by_id: BTreeMap<String, ProducedArtefact> = result
            .artefacts
            .into_iter()
            .map(|a| (a.artefact_id.clone(), a))
            .collect();
        let mut events = Vec::new();
        for produced_id in &self.job.produces {
            let event = match by_id.remove(produced_id) {
                Some(artefact) => {
                    let output = self.persist_output(artefact.blob, artefact.inline, artefact.value).await?;
                    ArtefactEvent {
                        artefact_id: produced_id.clone(),
                        produced_by: self.job.job_id.clone(),
                        inputs_hash: inputs_hash.to_string(),
                        output,
                        status: ArtefactStatus::Succeeded,
                        diagnostics: artefact.diagnostics,
                        revision: self.revision.clone(),
                        at: self.clock.now(),
                    }
                }
                // The handler reported success but omitted this artefact.
                None => ArtefactEvent {
                    artefact_id: produced_id.clone(),
                    produced_by: self.job.job_id.clone(),
                    inputs_hash: inputs_hash.to_string(),
                    output: ArtefactOutput::default(),
                    status: ArtefactStatus::Failed,
                    diagnostics: Some(Diagnostics {
                        provider: Some(self.job.provider.clone()),
                        model: Some(self.job.provider_model.clone()),
                        recoverable: Some(false),
                        message: Some("handler omitted this artefact".into()),
                        ..Diagnostics::default()
                    }),
                    revision: self.revision.clone(),
                    at: self.clock.now(),
                },
            };
            self.events.append_artefact(&self.movie_id, &event).await?;
            events.push(event);
        }
        Ok(events)
    }

    async fn persist_output(
        &self,
        blob: Option<rf_core::BlobRef>,
        inline: Option<rf_handler::InlineArtefact>,
        value: Option<serde_json::Value>,
    ) -> Result<ArtefactOutput, RuntimeError> {
        let blob = match (blob, inline) {
            (Some(blob_ref), _) => Some(blob_ref),
            (None, Some(inline)) => {
                Some(self.blobs.persist(&inline.bytes, &inline.mime_type).await?)
            }
            (None, None) => None,
        };
        Ok(ArtefactOutput { blob, value })
    }

    async fn record_failure(
        &self,
        inputs_hash: String,
        diagnostics: Diagnostics,
    ) -> Result<Vec<ArtefactEvent>, RuntimeError> {
        let mut events = Vec::new();
        for produced_id in &self.job.produces {
            let event = ArtefactEvent {
                artefact_id: produced_id.clone(),
                produced_by: self.job.job_id.clone(),
                inputs_hash: inputs_hash.clone(),
                output: ArtefactOutput::default(),
                status: ArtefactStatus::Failed,
                diagnostics: Some(diagnostics.clone()),
                revision: self.revision.clone(),
                at: self.clock.now(),
            };
            self.events.append_artefact(&self.movie_id, &event).await?;
            events.push(event);
        }
        Ok(events)
    }
}

async fn invoke_with_deadline(
    handler: Arc<dyn Handler>,
    ctx: JobContext,
    deadline: Option<Duration>,
) -> Result<anyhow::Result<ProviderResult>, tokio::time::error::Elapsed> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, handler.invoke(ctx)).await,
        None => Ok(handler.invoke(ctx).await),
    }
}
