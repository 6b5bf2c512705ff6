// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution plan wire format.
//!
//! A plan is a dependency-ordered sequence of layers; each layer holds jobs
//! with no dependencies among themselves. Plans are persisted to
//! `runs/<revision>-plan.json` and consumed by the execution runtime as-is.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One producer invocation the runtime must perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Canonical `Producer:` id, loop-indexed for loop instances.
    pub job_id: String,
    /// Dotted producer alias (without the loop selector).
    pub producer: String,
    /// Provider name the handler registry resolves against.
    pub provider: String,
    /// Provider model identifier.
    pub provider_model: String,
    /// Canonical ids of every consumed input and artefact.
    pub inputs: Vec<String>,
    /// Canonical ids of every produced artefact.
    pub produces: Vec<String>,
    /// Opaque invocation context passed through to the handler.
    pub context: JobInvocationContext,
    /// Attempt counter, starting at 1.
    pub attempt: u32,
}

/// Invocation context carried on every [`Job`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobInvocationContext {
    /// Map from the producer's local port names to canonical ids.
    pub input_bindings: BTreeMap<String, String>,
    /// Provider-specific options, passed through opaquely.
    pub provider_options: serde_json::Value,
    /// Rate-limit bucket key for the provider.
    pub rate_key: String,
}

/// A persisted execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Revision this plan was emitted under.
    pub revision: String,
    /// Hash of the manifest the plan was computed against.
    pub manifest_base_hash: Option<String>,
    /// Total layer count of the full blueprint (not just this plan).
    pub blueprint_layer_count: usize,
    /// Dependency-ordered layers of jobs.
    pub layers: Vec<Vec<Job>>,
    /// Emission timestamp.
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Total number of jobs across all layers.
    pub fn job_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// `true` when the plan schedules no work.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Vec::is_empty)
    }

    /// Iterate all jobs in layer order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.layers.iter().flatten()
    }

    /// Find a job by its canonical id.
    pub fn find_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs().find(|j| j.job_id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_job(id: &str) -> Job {
        Job {
            job_id: id.into(),
            producer: "P".into(),
            provider: "fal".into(),
            provider_model: "veo-3".into(),
            inputs: vec!["Input:Prompt".into()],
            produces: vec!["Artifact:Out".into()],
            context: JobInvocationContext {
                input_bindings: BTreeMap::from([("prompt".to_string(), "Input:Prompt".to_string())]),
                provider_options: serde_json::json!({}),
                rate_key: "fal".into(),
            },
            attempt: 1,
        }
    }

    #[test]
    fn plan_wire_format_is_camel_case() {
        let plan = Plan {
            revision: "rev-0003".into(),
            manifest_base_hash: None,
            blueprint_layer_count: 2,
            layers: vec![vec![sample_job("Producer:P")]],
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["blueprintLayerCount"], 2);
        assert_eq!(json["manifestBaseHash"], serde_json::Value::Null);
        assert_eq!(json["layers"][0][0]["jobId"], "Producer:P");
        assert_eq!(json["layers"][0][0]["providerModel"], "veo-3");
        assert_eq!(
            json["layers"][0][0]["context"]["inputBindings"]["prompt"],
            "Input:Prompt"
        );
        let back: Plan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn job_count_and_emptiness() {
        let mut plan = Plan {
            revision: "rev-0001".into(),
            manifest_base_hash: None,
            blueprint_layer_count: 0,
            layers: vec![],
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        };
        assert!(plan.is_empty());
        assert_eq!(plan.job_count(), 0);
        plan.layers = vec![vec![sample_job("Producer:A")], vec![sample_job("Producer:B")]];
        assert!(!plan.is_empty());
        assert_eq!(plan.job_count(), 2);
        assert!(plan.find_job("Producer:B").is_some());
        assert!(plan.find_job("Producer:C").is_none());
    }
}
