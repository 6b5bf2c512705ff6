// SPDX-License-Identifier: MIT OR Apache-2.0
//! The materialized manifest: a snapshot of current inputs and artefacts.
//!
//! Manifests are derived state: replaying every event in order and keeping
//! the last event per canonical id reconstructs the manifest exactly. The
//! `current.json` pointer names the authoritative snapshot for a movie.

use crate::event::{ArtefactStatus, Diagnostics, Event};
use crate::BlobRef;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current value of a single input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    /// Hash of the canonicalized value.
    pub hash: String,
    /// Canonical JSON form the hash was computed over.
    pub canonical: String,
    /// Inline scalar value, when the input is a scalar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Blob reference, when the input is binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_blob_ref: Option<BlobRef>,
}

/// Current state of a single artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactState {
    /// Hash of the canonicalized output.
    pub hash: String,
    /// Job id that produced it, or [`crate::USER_OVERRIDE_PRODUCER`].
    pub produced_by: String,
    /// Hash of the producing job's resolved input hashes; freshness is
    /// judged against this.
    pub inputs_hash: String,
    /// Terminal status of the latest production attempt.
    pub status: ArtefactStatus,
    /// Reference to persisted binary output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    /// Inline scalar output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Provider diagnostics from the latest attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    /// Timestamp of the latest attempt.
    pub created_at: DateTime<Utc>,
}

impl ArtefactState {
    /// `true` when the latest attempt succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.status == ArtefactStatus::Succeeded
    }
}

/// Materialized snapshot of a movie's current inputs and artefacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Revision label this snapshot was materialized under; `None` for a
    /// freshly initialized movie.
    pub revision: Option<String>,
    /// Input states keyed by canonical `Input:` id.
    pub inputs: BTreeMap<String, InputState>,
    /// Artefact states keyed by canonical `Artifact:` id.
    pub artefacts: BTreeMap<String, ArtefactState>,
    /// Hash of the prior manifest, for dirty propagation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_base_hash: Option<String>,
}

impl Manifest {
    /// An empty manifest with no revision, as loaded for a new movie.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `true` when the manifest has recorded no inputs yet (first run).
    pub fn is_initial(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Apply one event, keeping the last event per canonical id.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::Input(e) => {
                self.inputs.insert(
                    e.input_id.clone(),
                    InputState {
                        hash: e.hash.clone(),
                        canonical: e.canonical.clone(),
                        value: e.value.clone(),
                        value_blob_ref: e.value_blob_ref.clone(),
                    },
                );
            }
            Event::Artefact(e) => {
                self.artefacts.insert(
                    e.artefact_id.clone(),
                    ArtefactState {
                        hash: e.output.content_hash(),
                        produced_by: e.produced_by.clone(),
                        inputs_hash: e.inputs_hash.clone(),
                        status: e.status,
                        blob: e.output.blob.clone(),
                        value: e.output.value.clone(),
                        diagnostics: e.diagnostics.clone(),
                        created_at: e.at,
                    },
                );
            }
        }
    }

    /// Apply a sequence of events in order.
    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for ev in events {
            self.apply(ev);
        }
    }

    /// The stored hash a job input binding resolves to: an input's value
    /// hash or a produced artefact's output hash.
    pub fn binding_hash(&self, canonical_id: &str) -> Option<&str> {
        if let Some(input) = self.inputs.get(canonical_id) {
            return Some(&input.hash);
        }
        self.artefacts.get(canonical_id).map(|a| a.hash.as_str())
    }
}

/// A job input binding that has no stored hash in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job input `{id}` has no stored hash in the manifest")]
pub struct MissingBinding {
    /// The unresolved canonical id.
    pub id: String,
}

/// Hash of a job's resolved input hashes.
///
/// The job's input ids are sorted and deduplicated, each resolves to the
/// manifest's stored input hash or producing-artefact hash, and the
/// resulting sequence is hashed. Artefact freshness is judged against this
/// value.
pub fn job_inputs_hash(inputs: &[String], manifest: &Manifest) -> Result<String, MissingBinding> {
    let mut sorted: Vec<&String> = inputs.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hashes = Vec::with_capacity(sorted.len());
    for id in sorted {
        let hash = manifest
            .binding_hash(id)
            .ok_or_else(|| MissingBinding { id: id.clone() })?;
        hashes.push(serde_json::Value::String(hash.to_string()));
    }
    Ok(rf_hash::hash_value(&serde_json::Value::Array(hashes)))
}

/// The `current.json` pointer naming the authoritative manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPointer {
    /// Latest materialized revision; `None` for a fresh movie.
    pub revision: Option<String>,
    /// Storage path of the materialized manifest, relative to the movie
    /// root; `None` for a fresh movie.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    /// Hash of the manifest's canonical serialization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Last swap timestamp.
    pub updated_at: DateTime<Utc>,
}
