// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the Reelforge engine.
//!
//! Every engine error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, ordered key-value details, and an
//! optional cause. Codes are the contract; message text is informational
//! and may change between releases.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Build/movie lifecycle errors.
    Movie,
    /// Manifest and event-log integrity errors.
    Manifest,
    /// Plan emission and consumption errors.
    Plan,
    /// Blob store errors.
    Blob,
    /// Producer handler errors.
    Handler,
    /// Storage backend errors.
    Storage,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Movie => "movie",
            Self::Manifest => "manifest",
            Self::Plan => "plan",
            Self::Blob => "blob",
            Self::Handler => "handler",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Movie --
    /// Movie identifier does not match the allowed grammar.
    InvalidMovieId,
    /// No movie exists under the given identifier.
    MovieNotFound,

    // -- Manifest --
    /// Manifest or event record failed to parse.
    ManifestCorrupt,

    // -- Plan --
    /// No persisted plan exists for the requested revision.
    PlanNotFound,
    /// Blueprint validation rejected the plan request.
    PlanValidationFailed,

    // -- Blob --
    /// No blob exists for the given content hash.
    BlobNotFound,

    // -- Handler --
    /// A producer handler reported a terminal failure.
    HandlerFailed,
    /// No handler is registered for the requested provider/model pair.
    HandlerNotFound,

    // -- Storage --
    /// The storage backend is unreachable or persistently failing.
    StorageUnavailable,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidMovieId | Self::MovieNotFound => ErrorCategory::Movie,
            Self::ManifestCorrupt => ErrorCategory::Manifest,
            Self::PlanNotFound | Self::PlanValidationFailed => ErrorCategory::Plan,
            Self::BlobNotFound => ErrorCategory::Blob,
            Self::HandlerFailed | Self::HandlerNotFound => ErrorCategory::Handler,
            Self::StorageUnavailable => ErrorCategory::Storage,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"MOVIE_NOT_FOUND"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMovieId => "INVALID_MOVIE_ID",
            Self::MovieNotFound => "MOVIE_NOT_FOUND",
            Self::ManifestCorrupt => "MANIFEST_CORRUPT",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::PlanValidationFailed => "PLAN_VALIDATION_FAILED",
            Self::BlobNotFound => "BLOB_NOT_FOUND",
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Unified engine error: a stable [`ErrorCode`], a message, ordered
/// key-value details, and an optional cause.
///
/// Details keep insertion order so rendered errors read in the order the
/// failure unfolded, not alphabetically.
///
/// ```
/// use rf_error::{EngineError, ErrorCode};
///
/// let err = EngineError::new(ErrorCode::MovieNotFound, "no such movie")
///     .detail("movie_id", "trailer-042")
///     .detail("base_path", "movies");
/// assert_eq!(
///     err.to_string(),
///     r#"MOVIE_NOT_FOUND: no such movie (movie_id="trailer-042", base_path="movies")"#,
/// );
/// ```
#[derive(Debug)]
pub struct EngineError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Ordered structured details for diagnostics.
    pub details: Vec<(String, serde_json::Value)>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            source: None,
        }
    }

    /// Append a key-value detail. Values that fail to serialise are
    /// silently skipped.
    pub fn detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.push((key.into(), v));
        }
        self
    }

    /// Attach an underlying cause.
    pub fn caused_by(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Look up a detail by key (first match wins).
    pub fn find_detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// One-way JSON rendering for wire surfaces (viewer, logs).
    ///
    /// The cause chain is flattened into a `source` string; errors are
    /// never reconstructed from this form.
    pub fn to_value(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("code".into(), self.code.as_str().into());
        out.insert("category".into(), self.category().to_string().into());
        out.insert("message".into(), self.message.clone().into());
        if !self.details.is_empty() {
            out.insert(
                "details".into(),
                serde_json::Value::Object(self.details.iter().cloned().collect()),
            );
        }
        if let Some(source) = &self.source {
            out.insert("source".into(), source.to_string().into());
        }
        serde_json::Value::Object(out)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        let mut sep = " (";
        for (key, value) in &self.details {
            write!(f, "{sep}{key}={value}")?;
            sep = ", ";
        }
        if sep == ", " {
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
