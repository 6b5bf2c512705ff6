// SPDX-License-Identifier: MIT OR Apache-2.0
//! Input and artefact events, the append-only source of truth.
//!
//! Events are encoded as one JSON object per line (NDJSON) with a `type`
//! discriminator field. Replaying a movie's event streams in insertion order
//! reconstructs its manifest bit-for-bit.

use crate::BlobRef;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal status of an artefact production attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtefactStatus {
    /// The artefact was produced and persisted.
    Succeeded,
    /// Production failed; diagnostics say whether it is recoverable.
    Failed,
}

/// Opaque provider diagnostics attached to failed (and occasionally
/// succeeded) artefact events.
///
/// The engine only inspects `recoverable` and `provider_request_id` (the
/// recovery pre-pass keys off them); everything else passes through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Provider name, e.g. `"fal"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Provider model identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider-side request id, required for recovery probing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    /// Whether the failure may resolve on the provider side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    /// Human-readable failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Anything else the handler reported.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Diagnostics {
    /// `true` when the failure is flagged recoverable and carries a request id.
    pub fn is_probeable(&self) -> bool {
        self.recoverable == Some(true) && self.provider_request_id.is_some()
    }
}

/// The persisted payload of a produced artefact.
///
/// Exactly one of `blob` / `value` is normally set: binary outputs are
/// persisted through the blob store, scalar outputs inline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactOutput {
    /// Reference to persisted binary output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    /// Inline scalar output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ArtefactOutput {
    /// An output holding a blob reference.
    pub fn from_blob(blob: BlobRef) -> Self {
        Self {
            blob: Some(blob),
            value: None,
        }
    }

    /// An output holding an inline scalar.
    pub fn from_value(value: serde_json::Value) -> Self {
        Self {
            blob: None,
            value: Some(value),
        }
    }

    /// Hash of the canonicalized output, including any blob reference.
    pub fn content_hash(&self) -> String {
        let value =
            serde_json::to_value(self).expect("artefact output serialization is infallible");
        rf_hash::hash_value(&value)
    }
}

/// A recorded input value change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    /// Canonical `Input:` id.
    pub input_id: String,
    /// Hash of the canonicalized value (or blob-ref triple).
    pub hash: String,
    /// Canonical JSON form the hash was computed over.
    pub canonical: String,
    /// Inline scalar value, when the input is a scalar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Blob reference, when the input is binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_blob_ref: Option<BlobRef>,
    /// Revision the event was appended under.
    pub revision: String,
    /// Append timestamp.
    pub at: DateTime<Utc>,
}

/// A recorded artefact production outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactEvent {
    /// Canonical `Artifact:` id.
    pub artefact_id: String,
    /// Job id that produced it, or [`crate::USER_OVERRIDE_PRODUCER`].
    pub produced_by: String,
    /// Hash of the producing job's resolved input hashes.
    pub inputs_hash: String,
    /// The produced payload.
    pub output: ArtefactOutput,
    /// Terminal status.
    pub status: ArtefactStatus,
    /// Provider diagnostics, present on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    /// Revision the event was appended under.
    pub revision: String,
    /// Append timestamp.
    pub at: DateTime<Utc>,
}

/// Any event, with an on-wire `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An input value change.
    Input(InputEvent),
    /// An artefact production outcome.
    Artefact(ArtefactEvent),
}

impl Event {
    /// The canonical id this event is authoritative for.
    pub fn canonical_id(&self) -> &str {
        match self {
            Event::Input(e) => &e.input_id,
            Event::Artefact(e) => &e.artefact_id,
        }
    }

    /// Append timestamp.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Input(e) => e.at,
            Event::Artefact(e) => e.at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn input_event_round_trips_with_discriminator() {
        let ev = Event::Input(InputEvent {
            input_id: "Input:Prompt".into(),
            hash: "h".into(),
            canonical: "\"hi\"".into(),
            value: Some(serde_json::json!("hi")),
            value_blob_ref: None,
            revision: "rev-0001".into(),
            at: ts(),
        });
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.contains(r#""type":"input""#));
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn artefact_event_round_trips_with_discriminator() {
        let ev = Event::Artefact(ArtefactEvent {
            artefact_id: "Artifact:Out".into(),
            produced_by: "Producer:P".into(),
            inputs_hash: "ih".into(),
            output: ArtefactOutput::from_blob(BlobRef {
                hash: "bh".into(),
                size: 3,
                mime_type: "video/mp4".into(),
            }),
            status: ArtefactStatus::Succeeded,
            diagnostics: None,
            revision: "rev-0001".into(),
            at: ts(),
        });
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.contains(r#""type":"artefact""#));
        assert!(line.contains(r#""status":"succeeded""#));
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn diagnostics_probeable_requires_both_fields() {
        let mut d = Diagnostics {
            recoverable: Some(true),
            ..Diagnostics::default()
        };
        assert!(!d.is_probeable());
        d.provider_request_id = Some("r1".into());
        assert!(d.is_probeable());
        d.recoverable = Some(false);
        assert!(!d.is_probeable());
    }

    #[test]
    fn diagnostics_preserve_unknown_fields() {
        let json = serde_json::json!({
            "provider": "fal",
            "recoverable": true,
            "providerRequestId": "r1",
            "queuePosition": 7
        });
        let d: Diagnostics = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(d.extra["queuePosition"], serde_json::json!(7));
        let back = serde_json::to_value(&d).unwrap();
        assert_eq!(back, json);
    }
}
