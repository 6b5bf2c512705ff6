// SPDX-License-Identifier: MIT OR Apache-2.0
//! The handler contract.
//!
//! A [`Handler`] is an external component (a generative-model provider
//! adapter, an ffmpeg wrapper, a renderer) that the runtime invokes to
//! execute one producer job. The engine never inspects provider options,
//! extras, or diagnostics; they pass through opaquely.
//!
//! Handlers are resolved through a [`HandlerRegistry`]: a pure lookup table
//! keyed by `(provider, model, environment)` with `*` as the glob fallback
//! at each position.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use rf_core::{BlobRef, Diagnostics};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The wildcard key segment.
pub const GLOB: &str = "*";

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal handed to in-flight handlers.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for tokens created without a source.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// A token that never fires, for tests and one-shot invocations.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The owning side of a [`CancelToken`].
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Create a source and its token.
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            CancelToken {
                rx,
                _keepalive: None,
            },
        )
    }

    /// Request cancellation; all tokens observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Job context and results
// ---------------------------------------------------------------------------

/// A consumed binding resolved to its concrete payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    /// A scalar input or inline artefact value.
    Scalar(serde_json::Value),
    /// Persisted bytes with their content-addressed reference.
    Blob {
        /// The blob reference.
        blob_ref: BlobRef,
        /// The blob's bytes, pre-fetched by the runtime.
        bytes: Vec<u8>,
    },
}

/// Everything a handler needs to execute one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Canonical job id.
    pub job_id: String,
    /// Provider name the job was planned against.
    pub provider: String,
    /// Provider model identifier.
    pub model: String,
    /// Revision of the executing plan.
    pub revision: String,
    /// Index of the layer this job runs in.
    pub layer_index: usize,
    /// Attempt counter, starting at 1.
    pub attempt: u32,
    /// Canonical ids of consumed inputs and artefacts.
    pub inputs: Vec<String>,
    /// Canonical ids the handler must produce.
    pub produces: Vec<String>,
    /// Port name to resolved payload.
    pub bindings: BTreeMap<String, ResolvedValue>,
    /// Opaque provider options from the plan.
    pub provider_options: serde_json::Value,
    /// Deployment environment label (e.g. `"production"`).
    pub environment: String,
    /// Opaque extras; never inspected by the engine.
    pub extras: serde_json::Value,
    /// Cooperative cancellation signal.
    pub cancel: CancelToken,
}

/// Terminal status of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// All requested artefacts were produced.
    Succeeded,
    /// The invocation failed; diagnostics carry recoverability.
    Failed,
}

/// One artefact returned by a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducedArtefact {
    /// Canonical artefact id.
    pub artefact_id: String,
    /// Already-persisted output.
    pub blob: Option<BlobRef>,
    /// Raw output bytes for the runtime to persist.
    pub inline: Option<InlineArtefact>,
    /// Scalar output.
    pub value: Option<serde_json::Value>,
    /// Per-artefact diagnostics.
    pub diagnostics: Option<Diagnostics>,
}

/// Raw bytes pending persistence by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineArtefact {
    /// The bytes.
    pub bytes: Vec<u8>,
    /// Their MIME type.
    pub mime_type: String,
}

/// The outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    /// Terminal status.
    pub status: HandlerStatus,
    /// Produced artefacts (possibly partial on failure).
    pub artefacts: Vec<ProducedArtefact>,
    /// Invocation-level diagnostics.
    pub diagnostics: Option<Diagnostics>,
}

impl ProviderResult {
    /// A successful result carrying the given artefacts.
    pub fn succeeded(artefacts: Vec<ProducedArtefact>) -> Self {
        Self {
            status: HandlerStatus::Succeeded,
            artefacts,
            diagnostics: None,
        }
    }

    /// A failed result with diagnostics.
    pub fn failed(diagnostics: Diagnostics) -> Self {
        Self {
            status: HandlerStatus::Failed,
            artefacts: Vec::new(),
            diagnostics: Some(diagnostics),
        }
    }
}

// ---------------------------------------------------------------------------
// The Handler trait
// ---------------------------------------------------------------------------

/// An external producer implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Validate credentials and model availability ahead of a run.
    ///
    /// The default implementation does nothing.
    async fn warm_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Execute one job.
    ///
    /// Transient provider failures are retried *inside* the handler with
    /// provider-specific backoff; the runtime does not retry beyond the
    /// handler's budget.
    async fn invoke(&self, ctx: JobContext) -> anyhow::Result<ProviderResult>;

    /// Per-invocation deadline; `None` means no timeout.
    fn deadline(&self) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A pure lookup table from `(provider, model, environment)` to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String, String), Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous entry under the key.
    /// Any segment may be [`GLOB`].
    pub fn register(
        &mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        environment: impl Into<String>,
        handler: impl Handler + 'static,
    ) {
        self.handlers.insert(
            (provider.into(), model.into(), environment.into()),
            Arc::new(handler),
        );
    }

    /// Resolve a handler, trying exact matches before glob fallbacks.
    pub fn resolve(
        &self,
        provider: &str,
        model: &str,
        environment: &str,
    ) -> Option<Arc<dyn Handler>> {
        let candidates = [
            (provider, model, environment),
            (provider, model, GLOB),
            (provider, GLOB, environment),
            (provider, GLOB, GLOB),
            (GLOB, GLOB, GLOB),
        ];
        for (p, m, e) in candidates {
            if let Some(handler) = self
                .handlers
                .get(&(p.to_string(), m.to_string(), e.to_string()))
            {
                return Some(handler.clone());
            }
        }
        None
    }

    /// Sorted list of registered keys.
    pub fn list(&self) -> Vec<(String, String, String)> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Iterate all registered handlers (for warm-start fan-out).
    pub fn handlers(&self) -> impl Iterator<Item = (&(String, String, String), &Arc<dyn Handler>)> {
        self.handlers.iter()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` when no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
