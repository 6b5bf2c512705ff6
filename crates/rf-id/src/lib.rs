// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical identifier grammar for inputs, artefacts, and producers.
//!
//! Every stable name in the engine is an opaque string with a strict grammar:
//!
//! - `Input:<alias>.<key>`: a concrete input value slot.
//! - `Artifact:<alias>.<output>`: a produced output slot.
//! - `Producer:<alias>`: a producer instance.
//!
//! `<alias>` is a dotted producer path (`Parent.Child`); it is empty for
//! top-level inputs and artefacts, in which case the dot is elided
//! (`Input:Prompt`). Loop variants carry a trailing selector: `[3]` for a
//! concrete index, `[shot]` or `[shot+1]` for a symbolic index.
//!
//! This crate is the only place identifiers are constructed or inspected.
//! Everywhere else they travel as opaque strings, totally ordered by
//! lexicographic byte comparison.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::fmt::Display;
use thiserror::Error;

const INPUT_PREFIX: &str = "Input:";
const ARTIFACT_PREFIX: &str = "Artifact:";
const PRODUCER_PREFIX: &str = "Producer:";

/// Errors produced when parsing canonical identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The string does not match the identifier grammar.
    #[error("invalid canonical id `{0}`: {1}")]
    InvalidId(String, String),

    /// A trailing `[...]` selector is malformed.
    #[error("invalid loop selector `{0}`")]
    InvalidLoopSelector(String),
}

// ---------------------------------------------------------------------------
// LoopSelector
// ---------------------------------------------------------------------------

/// A loop-index selector attached to a canonical identifier.
///
/// Indices are zero-based. A symbolic selector `[sym+k]` resolves to the
/// loop variable's current index plus `k`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoopSelector {
    /// A concrete index, e.g. `[2]`.
    Const(u64),
    /// A symbolic index with a non-negative offset, e.g. `[shot]` / `[shot+1]`.
    Loop {
        /// Name of the loop variable.
        symbol: String,
        /// Offset added to the loop variable's index.
        offset: u64,
    },
}

impl LoopSelector {
    /// Substitute the loop symbol with a concrete index.
    ///
    /// Constant selectors pass through unchanged; symbolic selectors whose
    /// symbol matches resolve to `index + offset`.
    pub fn resolve(&self, symbol: &str, index: u64) -> LoopSelector {
        match self {
            LoopSelector::Const(v) => LoopSelector::Const(*v),
            LoopSelector::Loop { symbol: s, offset } if s == symbol => {
                LoopSelector::Const(index + offset)
            }
            other => other.clone(),
        }
    }

    /// The loop symbol, if this selector is symbolic.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            LoopSelector::Const(_) => None,
            LoopSelector::Loop { symbol, .. } => Some(symbol),
        }
    }
}

impl fmt::Display for LoopSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopSelector::Const(v) => write!(f, "[{v}]"),
            LoopSelector::Loop { symbol, offset: 0 } => write!(f, "[{symbol}]"),
            LoopSelector::Loop { symbol, offset } => write!(f, "[{symbol}+{offset}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// Identifier types
// ---------------------------------------------------------------------------

/// A parsed `Input:` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputId {
    /// Dotted producer path; empty for top-level inputs.
    pub alias: String,
    /// Declared input name.
    pub key: String,
    /// Optional loop-index selector.
    pub selector: Option<LoopSelector>,
}

impl InputId {
    /// Construct an input id from an alias (possibly empty) and a key.
    pub fn new(alias: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            key: key.into(),
            selector: None,
        }
    }

    /// Attach a concrete loop index.
    #[must_use]
    pub fn indexed(mut self, index: u64) -> Self {
        self.selector = Some(LoopSelector::Const(index));
        self
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(INPUT_PREFIX)?;
        write_dotted(f, &self.alias, &self.key)?;
        write_selector(f, &self.selector)
    }
}

/// A parsed `Artifact:` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    /// Dotted path of the declaring scope; empty for top-level artefacts.
    pub alias: String,
    /// Declared output name.
    pub output: String,
    /// Optional loop-index selector.
    pub selector: Option<LoopSelector>,
}

impl ArtifactId {
    /// Construct an artefact id from an alias (possibly empty) and a name.
    pub fn new(alias: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            output: output.into(),
            selector: None,
        }
    }

    /// Attach a concrete loop index.
    #[must_use]
    pub fn indexed(mut self, index: u64) -> Self {
        self.selector = Some(LoopSelector::Const(index));
        self
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ARTIFACT_PREFIX)?;
        write_dotted(f, &self.alias, &self.output)?;
        write_selector(f, &self.selector)
    }
}

/// A parsed `Producer:` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerId {
    /// Dotted producer path; never empty.
    pub alias: String,
    /// Optional loop-index selector.
    pub selector: Option<LoopSelector>,
}

impl ProducerId {
    /// Construct a producer id from its dotted alias.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            selector: None,
        }
    }

    /// Attach a concrete loop index.
    #[must_use]
    pub fn indexed(mut self, index: u64) -> Self {
        self.selector = Some(LoopSelector::Const(index));
        self
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PRODUCER_PREFIX}{}", self.alias)?;
        write_selector(f, &self.selector)
    }
}

/// Any parsed canonical identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalId {
    /// An `Input:` identifier.
    Input(InputId),
    /// An `Artifact:` identifier.
    Artifact(ArtifactId),
    /// A `Producer:` identifier.
    Producer(ProducerId),
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalId::Input(id) => id.fmt(f),
            CanonicalId::Artifact(id) => id.fmt(f),
            CanonicalId::Producer(id) => id.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse any canonical identifier.
///
/// # Examples
///
/// ```
/// use rf_id::{parse, CanonicalId, LoopSelector};
///
/// let id = parse("Artifact:Shots.Frame[2]").unwrap();
/// match id {
///     CanonicalId::Artifact(a) => {
///         assert_eq!(a.alias, "Shots");
///         assert_eq!(a.output, "Frame");
///         assert_eq!(a.selector, Some(LoopSelector::Const(2)));
///     }
///     _ => unreachable!(),
/// }
/// ```
pub fn parse(id: &str) -> Result<CanonicalId, IdError> {
    if let Some(body) = id.strip_prefix(INPUT_PREFIX) {
        let (body, selector) = split_selector(id, body)?;
        let (alias, key) = split_dotted(id, body)?;
        return Ok(CanonicalId::Input(InputId {
            alias,
            key,
            selector,
        }));
    }
    if let Some(body) = id.strip_prefix(ARTIFACT_PREFIX) {
        let (body, selector) = split_selector(id, body)?;
        let (alias, output) = split_dotted(id, body)?;
        return Ok(CanonicalId::Artifact(ArtifactId {
            alias,
            output,
            selector,
        }));
    }
    if let Some(body) = id.strip_prefix(PRODUCER_PREFIX) {
        let (body, selector) = split_selector(id, body)?;
        if body.is_empty() {
            return Err(invalid(id, "producer alias must not be empty"));
        }
        check_alias(id, body)?;
        return Ok(CanonicalId::Producer(ProducerId {
            alias: body.to_string(),
            selector,
        }));
    }
    Err(invalid(id, "unknown prefix"))
}

/// `true` if the string parses as an `Input:` identifier.
pub fn is_input_id(id: &str) -> bool {
    matches!(parse(id), Ok(CanonicalId::Input(_)))
}

/// `true` if the string parses as an `Artifact:` identifier.
pub fn is_artifact_id(id: &str) -> bool {
    matches!(parse(id), Ok(CanonicalId::Artifact(_)))
}

/// `true` if the string parses as a `Producer:` identifier.
pub fn is_producer_id(id: &str) -> bool {
    matches!(parse(id), Ok(CanonicalId::Producer(_)))
}

/// Join a namespace path and a local producer name into a dotted alias.
///
/// An empty namespace is elided: `format_producer_alias("", "Shots")` is
/// `"Shots"`, `format_producer_alias("Movie.Act1", "Shots")` is
/// `"Movie.Act1.Shots"`.
pub fn format_producer_alias(namespace: &str, local: &str) -> String {
    if namespace.is_empty() {
        local.to_string()
    } else {
        format!("{namespace}.{local}")
    }
}

fn invalid(id: &str, reason: &str) -> IdError {
    IdError::InvalidId(id.to_string(), reason.to_string())
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn check_segment(id: &str, seg: &str) -> Result<(), IdError> {
    if seg.is_empty() {
        return Err(invalid(id, "empty path segment"));
    }
    if !seg.chars().all(is_segment_char) {
        return Err(invalid(id, "segment contains illegal character"));
    }
    Ok(())
}

fn check_alias(id: &str, alias: &str) -> Result<(), IdError> {
    for seg in alias.split('.') {
        check_segment(id, seg)?;
    }
    Ok(())
}

/// Split `body` into `(alias, last_segment)`; the alias is empty when the
/// body holds a single segment.
fn split_dotted(id: &str, body: &str) -> Result<(String, String), IdError> {
    if body.is_empty() {
        return Err(invalid(id, "empty name"));
    }
    match body.rfind('.') {
        Some(pos) => {
            let alias = &body[..pos];
            let name = &body[pos + 1..];
            check_alias(id, alias)?;
            check_segment(id, name)?;
            Ok((alias.to_string(), name.to_string()))
        }
        None => {
            check_segment(id, body)?;
            Ok((String::new(), body.to_string()))
        }
    }
}

/// Strip a trailing `[...]` selector, if present.
fn split_selector<'a>(
    id: &str,
    body: &'a str,
) -> Result<(&'a str, Option<LoopSelector>), IdError> {
    let Some(open) = body.find('[') else {
        return Ok((body, None));
    };
    if !body.ends_with(']') {
        return Err(IdError::InvalidLoopSelector(body[open..].to_string()));
    }
    let inner = &body[open + 1..body.len() - 1];
    let selector = parse_selector(inner)
        .ok_or_else(|| IdError::InvalidLoopSelector(body[open..].to_string()))?;
    Ok((&body[..open], Some(selector)))
}

fn parse_selector(inner: &str) -> Option<LoopSelector> {
    if inner.is_empty() {
        return None;
    }
    if inner.chars().all(|c| c.is_ascii_digit()) {
        return inner.parse().ok().map(LoopSelector::Const);
    }
    let (symbol, offset) = match inner.split_once('+') {
        Some((sym, off)) => {
            if off.is_empty() || !off.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (sym, off.parse().ok()?)
        }
        None => (inner, 0),
    };
    let mut chars = symbol.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(LoopSelector::Loop {
        symbol: symbol.to_string(),
        offset,
    })
}

fn write_dotted(f: &mut fmt::Formatter<'_>, alias: &str, name: &str) -> fmt::Result {
    if alias.is_empty() {
        f.write_str(name)
    } else {
        write!(f, "{alias}.{name}")
    }
}

fn write_selector(f: &mut fmt::Formatter<'_>, selector: &Option<LoopSelector>) -> fmt::Result {
    match selector {
        Some(s) => s.fmt(f),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
