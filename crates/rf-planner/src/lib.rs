// SPDX-License-Identifier: MIT OR Apache-2.0
//! The planner: dirty detection, surgical scoping, layering, and plan
//! emission.
//!
//! Given a validated blueprint, the resolved input map, and the movie's
//! prior manifest, the planner computes the minimal set of producer jobs
//! whose prior output is missing or stale, lays them out in
//! dependency-ordered layers, persists the plan, and explains every
//! scheduling decision.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dirty;
mod expand;
mod explain;
mod plan_store;

pub use expand::{Expansion, JobInstance, BUILTIN_PROVIDER, COLLECT_MODEL};
pub use explain::{DirtyReason, PlanExplanation};
pub use plan_store::{PlanStore, PlanStoreError};

use rf_blob::{BlobError, BlobStore};
use rf_blueprint::{validate, Blueprint, ValidationResult};
use rf_core::{
    job_inputs_hash, next_revision, ArtefactEvent, ArtefactOutput, Clock, Event, InputEvent,
    InputValue, Plan, USER_OVERRIDE_PRODUCER,
};
use rf_events::{EventLog, EventLogError};
use rf_manifest::{ManifestError, ManifestService};
use rf_storage::{StorageContext, StorageError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

/// A user-edited artefact value recorded ahead of plan persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtefactDraft {
    /// Canonical artefact id being overridden.
    pub artefact_id: String,
    /// The override payload.
    pub output: ArtefactOutput,
}

/// Options shaping one planning pass.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Surgical mode: regenerate exactly these artefacts (and any dirty
    /// ancestors they require). Descendants are excluded.
    pub artifact_ids: Vec<String>,
    /// Hard cap on the blueprint layer index of emitted jobs.
    pub up_to_layer: Option<usize>,
    /// User overrides appended as `user-override` artefact events.
    pub pending_artefact_drafts: Vec<ArtefactDraft>,
}

/// A computed plan plus its explanation.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// The persisted plan.
    pub plan: Plan,
    /// Why each job was scheduled (or excluded).
    pub explanation: PlanExplanation,
    /// Number of events appended during planning.
    pub appended_events: usize,
}

/// Errors flowing out of the planner. Any error aborts plan emission
/// entirely; no partial plan is written.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Blueprint validation rejected the request. The message leads with
    /// the first stable `V###` code.
    #[error("{}", validation_message(.0))]
    Validation(ValidationResult),

    /// A loop count could not be resolved to a non-negative integer.
    #[error("producer `{producer}` loop count from `{source}` is unusable: {detail}")]
    BadCount {
        /// Producer alias.
        producer: String,
        /// Count source id.
        source: String,
        /// What went wrong.
        detail: String,
    },

    /// A condition gate could not be resolved to a boolean.
    #[error("condition `{condition}` is unusable: {detail}")]
    BadCondition {
        /// Condition name.
        condition: String,
        /// What went wrong.
        detail: String,
    },

    /// A leaf producer has no resolvable provider (dangling import).
    #[error("producer `{producer}` has no resolvable provider")]
    UnresolvableProducer {
        /// Producer alias.
        producer: String,
    },

    /// A surgical target does not correspond to any expanded job.
    #[error("surgical target `{artefact}` is not produced by any job")]
    UnknownTarget {
        /// The unknown artefact id.
        artefact: String,
    },

    /// Manifest service failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Event log failure.
    #[error(transparent)]
    Events(#[from] EventLogError),

    /// Blob store failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Plan store failure.
    #[error(transparent)]
    PlanStore(#[from] PlanStoreError),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn validation_message(result: &ValidationResult) -> String {
    let rendered: Vec<String> = result.errors.iter().map(|i| i.to_string()).collect();
    rendered.join("; ")
}

/// The planner service.
#[derive(Clone)]
pub struct Planner {
    ctx: StorageContext,
    manifest: ManifestService,
    events: EventLog,
    plans: PlanStore,
    clock: std::sync::Arc<dyn Clock>,
}

impl Planner {
    /// Create a planner over a storage context and clock.
    pub fn new(ctx: StorageContext, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            manifest: ManifestService::new(ctx.clone()),
            events: EventLog::new(ctx.clone()),
            plans: PlanStore::new(ctx.clone()),
            ctx,
            clock,
        }
    }

    /// The plan store plans are persisted through.
    pub fn plan_store(&self) -> &PlanStore {
        &self.plans
    }

    /// Compute, persist, and explain a plan.
    pub async fn plan(
        &self,
        movie_id: &str,
        blueprint: &Blueprint,
        inputs: &BTreeMap<String, InputValue>,
        options: &PlanOptions,
    ) -> Result<PlanOutcome, PlannerError> {
        // 0. The planner refuses to run while validation errors exist.
        let validation = validate(blueprint);
        if !validation.is_valid() {
            return Err(PlannerError::Validation(validation));
        }

        let pointer = self.manifest.pointer(movie_id).await?;
        let prior = self.manifest.load(movie_id).await?;
        let revision = next_revision(pointer.revision.as_deref());
        let blobs = BlobStore::new(self.ctx.clone(), movie_id);

        // 1. Append input events for every changed canonical input.
        let mut new_events: Vec<Event> = Vec::new();
        let mut dirty_inputs: BTreeSet<String> = BTreeSet::new();
        for (input_id, value) in inputs {
            let resolved = match value {
                InputValue::Pending(pending) => InputValue::Blob(
                    blobs.persist(&pending.bytes, &pending.mime_type).await?,
                ),
                other => other.clone(),
            };
            let Some(hashed) = resolved.hashed() else {
                continue; // unreachable: pending blobs were just persisted
            };
            let prior_hash = prior.inputs.get(input_id).map(|s| s.hash.as_str());
            if prior_hash == Some(hashed.hash.as_str()) {
                continue;
            }
            let (scalar, blob_ref) = match &resolved {
                InputValue::Scalar(v) => (Some(v.clone()), None),
                InputValue::Blob(b) => (None, Some(b.clone())),
                InputValue::Pending(_) => (None, None),
            };
            let event = InputEvent {
                input_id: input_id.clone(),
                hash: hashed.hash,
                canonical: hashed.canonical,
                value: scalar,
                value_blob_ref: blob_ref,
                revision: revision.clone(),
                at: self.clock.now(),
            };
            self.events.append_input(movie_id, &event).await?;
            dirty_inputs.insert(input_id.clone());
            new_events.push(Event::Input(event));
        }

        // 2. Expand the blueprint into job instances against the values
        //    visible after this pass's input events.
        let mut with_inputs = prior.clone();
        with_inputs.apply_all(new_events.iter());
        let values = expand::PlanningValues::new(
            with_inputs
                .inputs
                .iter()
                .filter_map(|(id, state)| state.value.clone().map(|v| (id.clone(), v)))
                .collect(),
        );
        let expansion = expand::expand(blueprint, &values)?;

        // 3-4. Dirty detection and propagation.
        let analysis = dirty::analyze(&expansion.jobs, &prior, &with_inputs, &dirty_inputs);

        // 5. Surgical scoping.
        let mut reasons = analysis.reasons.clone();
        let mut excluded: Vec<String> = Vec::new();
        let selected: BTreeSet<String> = if options.artifact_ids.is_empty() {
            reasons.keys().cloned().collect()
        } else {
            let produced_by: BTreeMap<&str, &JobInstance> = expansion
                .jobs
                .iter()
                .flat_map(|i| i.job.produces.iter().map(move |p| (p.as_str(), i)))
                .collect();
            let mut targets: BTreeSet<String> = BTreeSet::new();
            for artefact in &options.artifact_ids {
                let Some(instance) = produced_by.get(artefact.as_str()) else {
                    return Err(PlannerError::UnknownTarget {
                        artefact: artefact.clone(),
                    });
                };
                targets.insert(instance.job.job_id.clone());
            }
            // Ancestor closure of the targets.
            let by_id: BTreeMap<&str, &JobInstance> = expansion
                .jobs
                .iter()
                .map(|i| (i.job.job_id.as_str(), i))
                .collect();
            let mut closure = targets.clone();
            let mut queue: Vec<String> = targets.iter().cloned().collect();
            while let Some(job_id) = queue.pop() {
                if let Some(instance) = by_id.get(job_id.as_str()) {
                    for artefact in &instance.consumed_artefacts {
                        if let Some(parent) = produced_by.get(artefact.as_str()) {
                            if closure.insert(parent.job.job_id.clone()) {
                                queue.push(parent.job.job_id.clone());
                            }
                        }
                    }
                }
            }
            // Targets regenerate even when clean; ancestors come along only
            // when dirty. Descendants never do.
            for target in &targets {
                reasons
                    .entry(target.clone())
                    .or_insert_with(|| vec![DirtyReason::SurgicalTarget]);
            }
            reasons
                .keys()
                .filter(|id| closure.contains(*id))
                .cloned()
                .collect()
        };
        for job_id in reasons.keys() {
            if !selected.contains(job_id) {
                excluded.push(job_id.clone());
            }
        }

        // 6. Layer cap.
        let capped: BTreeSet<String> = match options.up_to_layer {
            Some(cap) => {
                let mut kept = BTreeSet::new();
                for instance in &expansion.jobs {
                    if selected.contains(&instance.job.job_id) {
                        if instance.layer <= cap {
                            kept.insert(instance.job.job_id.clone());
                        } else {
                            excluded.push(instance.job.job_id.clone());
                        }
                    }
                }
                kept
            }
            None => selected,
        };

        // 7. Layering of the remaining jobs; lex tie-break inside a layer.
        let planned: Vec<&JobInstance> = expansion
            .jobs
            .iter()
            .filter(|i| capped.contains(&i.job.job_id))
            .collect();
        let produced_by_planned: BTreeMap<&str, &str> = planned
            .iter()
            .flat_map(|i| {
                i.job
                    .produces
                    .iter()
                    .map(move |p| (p.as_str(), i.job.job_id.as_str()))
            })
            .collect();
        let mut plan_layer: BTreeMap<&str, usize> = BTreeMap::new();
        for instance in &planned {
            let mut layer = 0;
            for artefact in &instance.consumed_artefacts {
                if let Some(&dep) = produced_by_planned.get(artefact.as_str()) {
                    if dep != instance.job.job_id {
                        // Expansion order is topological, so the dep's layer
                        // is already assigned.
                        layer = layer.max(plan_layer.get(dep).copied().unwrap_or(0) + 1);
                    }
                }
            }
            plan_layer.insert(instance.job.job_id.as_str(), layer);
        }
        let layer_count = plan_layer.values().map(|&l| l + 1).max().unwrap_or(0);
        let mut layers: Vec<Vec<rf_core::Job>> = vec![Vec::new(); layer_count];
        for instance in &planned {
            let layer = plan_layer[instance.job.job_id.as_str()];
            layers[layer].push(instance.job.clone());
        }
        for layer in &mut layers {
            layer.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        }

        // 8. Record pending artefact drafts ahead of plan persistence so
        //    subsequent dirty detection sees them.
        for draft in &options.pending_artefact_drafts {
            let inputs_hash = expansion
                .jobs
                .iter()
                .find(|i| i.job.produces.contains(&draft.artefact_id))
                .and_then(|i| job_inputs_hash(&i.job.inputs, &with_inputs).ok())
                .or_else(|| {
                    prior
                        .artefacts
                        .get(&draft.artefact_id)
                        .map(|s| s.inputs_hash.clone())
                })
                .unwrap_or_default();
            let event = ArtefactEvent {
                artefact_id: draft.artefact_id.clone(),
                produced_by: USER_OVERRIDE_PRODUCER.to_string(),
                inputs_hash,
                output: draft.output.clone(),
                status: rf_core::ArtefactStatus::Succeeded,
                diagnostics: None,
                revision: revision.clone(),
                at: self.clock.now(),
            };
            self.events.append_artefact(movie_id, &event).await?;
            new_events.push(Event::Artefact(event));
        }

        // 9. Persist the plan, then materialize if events were appended.
        let plan = Plan {
            revision: revision.clone(),
            manifest_base_hash: pointer.hash.clone(),
            blueprint_layer_count: expansion.layer_count,
            layers,
            created_at: self.clock.now(),
        };
        self.plans.save(movie_id, &plan).await?;
        if !new_events.is_empty() {
            self.manifest
                .materialize(movie_id, &revision, &new_events, self.clock.now())
                .await?;
        }

        excluded.sort();
        excluded.dedup();
        let explanation = PlanExplanation {
            job_reasons: reasons
                .into_iter()
                .filter(|(id, _)| capped_contains(&plan, id))
                .collect(),
            dirty_inputs: dirty_inputs.into_iter().collect(),
            dirty_artefacts: analysis.dirty_artefacts.clone(),
            initial_dirty_jobs: analysis.initial.clone(),
            propagated_jobs: analysis.propagated.clone(),
            surgical_targets: (!options.artifact_ids.is_empty())
                .then(|| options.artifact_ids.clone()),
            excluded_jobs: excluded,
        };

        info!(
            target: "rf.planner",
            movie_id,
            revision = %plan.revision,
            jobs = plan.job_count(),
            layers = plan.layers.len(),
            events = new_events.len(),
            "plan emitted"
        );
        debug!(target: "rf.planner", summary = %explanation.summary(), "plan explanation");

        Ok(PlanOutcome {
            plan,
            explanation,
            appended_events: new_events.len(),
        })
    }
}

fn capped_contains(plan: &Plan, job_id: &str) -> bool {
    plan.jobs().any(|j| j.job_id == job_id)
}
