// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dirty detection and forward propagation.
//!
//! A job is initially dirty when its prior output is missing or stale;
//! dirtiness then propagates forward through the dependency graph, with the
//! upstream trigger recorded for every propagated job.

use crate::expand::JobInstance;
use crate::explain::DirtyReason;
use rf_core::{job_inputs_hash, Manifest};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of the dirty analysis.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirtyAnalysis {
    /// Reasons per dirty job id.
    pub reasons: BTreeMap<String, Vec<DirtyReason>>,
    /// Jobs dirty before propagation.
    pub initial: Vec<String>,
    /// Jobs dirtied only by propagation.
    pub propagated: Vec<String>,
    /// Artefacts produced by dirty jobs.
    pub dirty_artefacts: Vec<String>,
}

impl DirtyAnalysis {
    pub(crate) fn is_dirty(&self, job_id: &str) -> bool {
        self.reasons.contains_key(job_id)
    }
}

/// Analyze the expanded jobs against the prior manifest.
///
/// `prior` is the manifest before this planning pass; `with_inputs` is the
/// same manifest with this pass's input events applied (the basis for
/// recomputing `inputsHash`). `dirty_inputs` holds the canonical ids whose
/// value changed in this pass.
pub(crate) fn analyze(
    jobs: &[JobInstance],
    prior: &Manifest,
    with_inputs: &Manifest,
    dirty_inputs: &BTreeSet<String>,
) -> DirtyAnalysis {
    let mut analysis = DirtyAnalysis::default();
    let first_run = prior.is_initial();

    // Pass 1: initial dirtiness.
    for instance in jobs {
        let job = &instance.job;
        let mut reasons = Vec::new();

        if first_run {
            reasons.push(DirtyReason::Initial);
        }
        for produced in &job.produces {
            match prior.artefacts.get(produced) {
                Some(state) if state.is_succeeded() => {}
                _ => reasons.push(DirtyReason::ProducesMissing {
                    artefact: produced.clone(),
                }),
            }
        }
        for input in &job.inputs {
            if dirty_inputs.contains(input) {
                reasons.push(DirtyReason::TouchesDirtyInput {
                    input: input.clone(),
                });
            }
        }
        // Only a job whose outputs all exist can be judged by hash; a
        // missing binding just means an upstream producer will propagate.
        if reasons.is_empty() {
            if let Ok(recomputed) = job_inputs_hash(&job.inputs, with_inputs) {
                for produced in &job.produces {
                    if let Some(state) = prior.artefacts.get(produced) {
                        if state.inputs_hash != recomputed {
                            reasons.push(DirtyReason::InputsHashChanged {
                                artefact: produced.clone(),
                            });
                        }
                    }
                }
            }
        }

        if !reasons.is_empty() {
            analysis.initial.push(job.job_id.clone());
            analysis.reasons.insert(job.job_id.clone(), reasons);
        }
    }

    // Pass 2: forward propagation in layer order. Jobs are sorted by layer,
    // so a single pass reaches a fixpoint.
    let produced_by: BTreeMap<&str, &str> = jobs
        .iter()
        .flat_map(|i| {
            i.job
                .produces
                .iter()
                .map(move |p| (p.as_str(), i.job.job_id.as_str()))
        })
        .collect();
    for instance in jobs {
        let job = &instance.job;
        if analysis.reasons.contains_key(&job.job_id) {
            continue;
        }
        let mut reasons = Vec::new();
        for artefact in &instance.consumed_artefacts {
            if let Some(&producer) = produced_by.get(artefact.as_str()) {
                if analysis.reasons.contains_key(producer) {
                    reasons.push(DirtyReason::TouchesDirtyArtefact {
                        artefact: artefact.clone(),
                        trigger: producer.to_string(),
                    });
                }
            }
        }
        if !reasons.is_empty() {
            analysis.propagated.push(job.job_id.clone());
            analysis.reasons.insert(job.job_id.clone(), reasons);
        }
    }

    for instance in jobs {
        if analysis.is_dirty(&instance.job.job_id) {
            analysis
                .dirty_artefacts
                .extend(instance.job.produces.iter().cloned());
        }
    }
    analysis.dirty_artefacts.sort();
    analysis.dirty_artefacts.dedup();

    debug!(
        target: "rf.planner",
        initial = analysis.initial.len(),
        propagated = analysis.propagated.len(),
        "dirty analysis complete"
    );
    analysis
}
