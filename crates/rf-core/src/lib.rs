// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable contract types for the Reelforge engine.
//!
//! Everything that crosses a crate boundary or lands on disk is defined
//! here: blob references, input/artefact events, the materialized manifest,
//! the execution plan, and the on-disk pointers. If you only take one
//! dependency, take this one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Event types and the tagged on-wire encoding.
pub mod event;
/// Manifest snapshot and current-pointer types.
pub mod manifest;
/// Execution plan and job wire format.
pub mod plan;
/// Revision label helpers (`rev-NNNN`).
pub mod revision;

pub use event::{ArtefactEvent, ArtefactOutput, ArtefactStatus, Diagnostics, Event, InputEvent};
pub use manifest::{
    job_inputs_hash, ArtefactState, CurrentPointer, InputState, Manifest, MissingBinding,
};
pub use plan::{Job, JobInvocationContext, Plan};
pub use revision::{format_revision, next_revision, revision_number};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Engine version string stamped into movie metadata.
pub const ENGINE_VERSION: &str = "reelforge/v0.1";

/// Job id recorded as the producer of user-edited artefact drafts.
pub const USER_OVERRIDE_PRODUCER: &str = "user-override";

// ---------------------------------------------------------------------------
// Blob references
// ---------------------------------------------------------------------------

/// Reference to stored binary data.
///
/// A blob reference is the sole way the engine denotes stored bytes; the
/// bytes themselves live in the content-addressed blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    /// Hex-encoded SHA-256 of the blob contents.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type recorded at persistence time.
    pub mime_type: String,
}

/// Binary input bytes that have not yet been persisted to the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlob {
    /// Raw bytes to persist.
    pub bytes: Vec<u8>,
    /// MIME type of the bytes.
    pub mime_type: String,
}

/// A concrete value for a canonical input id.
///
/// Scalars are JSON; files are either already-persisted [`BlobRef`]s or
/// [`PendingBlob`]s awaiting persistence by the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A JSON scalar, object, or array.
    Scalar(serde_json::Value),
    /// A reference to already-persisted bytes.
    Blob(BlobRef),
    /// Bytes pending persistence.
    Pending(PendingBlob),
}

impl BlobRef {
    /// Canonical JSON of the `{hash, size, mimeType}` triple.
    ///
    /// Binary inputs hash over this triple rather than the bytes, so
    /// re-uploading identical bytes never dirties downstream jobs.
    pub fn canonical_triple(&self) -> serde_json::Value {
        serde_json::json!({
            "hash": self.hash,
            "size": self.size,
            "mimeType": self.mime_type,
        })
    }
}

/// The hash and canonical form of a resolved input value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedValue {
    /// Hex-encoded SHA-256 of `canonical`.
    pub hash: String,
    /// Canonical JSON the hash was computed over.
    pub canonical: String,
}

impl InputValue {
    /// Convenience constructor for a scalar value.
    pub fn scalar(value: impl Into<serde_json::Value>) -> Self {
        InputValue::Scalar(value.into())
    }

    /// Hash the value into its canonical fingerprint.
    ///
    /// Returns `None` for [`InputValue::Pending`]: pending bytes must be
    /// persisted into a [`BlobRef`] before they can be hashed.
    pub fn hashed(&self) -> Option<HashedValue> {
        let canonical = match self {
            InputValue::Scalar(v) => rf_hash::canonical_json(v),
            InputValue::Blob(blob) => rf_hash::canonical_json(&blob.canonical_triple()),
            InputValue::Pending(_) => return None,
        };
        Some(HashedValue {
            hash: rf_hash::hash_bytes(canonical.as_bytes()),
            canonical,
        })
    }
}

// ---------------------------------------------------------------------------
// Movie metadata
// ---------------------------------------------------------------------------

/// Per-movie metadata stored at `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MovieMetadata {
    /// Path of the blueprint the movie was last planned against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blueprint_path: Option<String>,
    /// Path of the inputs file last used for planning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inputs_path: Option<String>,
    /// Human-readable display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Engine version that initialized the movie.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source abstraction so planner and runtime are deterministic in tests.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock [`Clock`] backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`Clock`] pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
