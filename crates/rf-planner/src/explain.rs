// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan explanations.
//!
//! Every scheduling decision the planner makes is recorded here so callers
//! can answer "why is this job in the plan" without re-deriving it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Why a job entered the dirty set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DirtyReason {
    /// First run: the manifest has no recorded inputs.
    Initial,
    /// A produced artefact is absent (or last failed) in the manifest.
    #[serde(rename_all = "camelCase")]
    ProducesMissing {
        /// The missing artefact id.
        artefact: String,
    },
    /// A consumed input changed in this planning pass.
    #[serde(rename_all = "camelCase")]
    TouchesDirtyInput {
        /// The changed input id.
        input: String,
    },
    /// A consumed artefact is produced by a job already marked dirty.
    #[serde(rename_all = "camelCase")]
    TouchesDirtyArtefact {
        /// The consumed artefact id.
        artefact: String,
        /// The upstream dirty job that triggered propagation.
        trigger: String,
    },
    /// The stored `inputsHash` no longer matches the recomputed one.
    #[serde(rename_all = "camelCase")]
    InputsHashChanged {
        /// The stale artefact id.
        artefact: String,
    },
    /// The job was forced by surgical regeneration targets.
    SurgicalTarget,
}

impl DirtyReason {
    /// Short label for rendering.
    pub fn label(&self) -> &'static str {
        match self {
            DirtyReason::Initial => "initial",
            DirtyReason::ProducesMissing { .. } => "producesMissing",
            DirtyReason::TouchesDirtyInput { .. } => "touchesDirtyInput",
            DirtyReason::TouchesDirtyArtefact { .. } => "touchesDirtyArtefact",
            DirtyReason::InputsHashChanged { .. } => "inputsHashChanged",
            DirtyReason::SurgicalTarget => "surgicalTarget",
        }
    }
}

/// The full explanation emitted next to a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExplanation {
    /// Reasons per planned job id.
    pub job_reasons: BTreeMap<String, Vec<DirtyReason>>,
    /// Inputs whose value changed in this pass.
    pub dirty_inputs: Vec<String>,
    /// Artefacts produced by dirty jobs.
    pub dirty_artefacts: Vec<String>,
    /// Jobs dirty before propagation.
    pub initial_dirty_jobs: Vec<String>,
    /// Jobs dirtied only by propagation.
    pub propagated_jobs: Vec<String>,
    /// Surgical targets, when surgical mode was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surgical_targets: Option<Vec<String>>,
    /// Jobs excluded by the surgical filter or the layer cap.
    pub excluded_jobs: Vec<String>,
}

impl PlanExplanation {
    /// Human-readable rendering, one line per job.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if let Some(targets) = &self.surgical_targets {
            let _ = writeln!(out, "surgical targets: {}", targets.join(", "));
        }
        if !self.dirty_inputs.is_empty() {
            let _ = writeln!(out, "dirty inputs: {}", self.dirty_inputs.join(", "));
        }
        for (job, reasons) in &self.job_reasons {
            let labels: Vec<&str> = reasons.iter().map(DirtyReason::label).collect();
            let _ = writeln!(out, "{job}: {}", labels.join(" + "));
        }
        if !self.excluded_jobs.is_empty() {
            let _ = writeln!(out, "excluded: {}", self.excluded_jobs.join(", "));
        }
        if self.job_reasons.is_empty() {
            let _ = writeln!(out, "nothing to do");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_serialize_with_kind_tags() {
        let reason = DirtyReason::TouchesDirtyInput {
            input: "Input:Prompt".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "touchesDirtyInput");
        assert_eq!(json["input"], "Input:Prompt");
        let back: DirtyReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn summary_lists_jobs_and_reasons() {
        let mut explanation = PlanExplanation::default();
        explanation.dirty_inputs.push("Input:Prompt".into());
        explanation.job_reasons.insert(
            "Producer:P".into(),
            vec![DirtyReason::TouchesDirtyInput {
                input: "Input:Prompt".into(),
            }],
        );
        let text = explanation.summary();
        assert!(text.contains("dirty inputs: Input:Prompt"));
        assert!(text.contains("Producer:P: touchesDirtyInput"));
    }

    #[test]
    fn empty_summary_says_nothing_to_do() {
        assert!(PlanExplanation::default().summary().contains("nothing to do"));
    }
}
