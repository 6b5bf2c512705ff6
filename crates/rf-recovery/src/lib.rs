// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recovery pre-pass.
//!
//! Providers sometimes finish a request after the engine recorded a
//! timeout or transient failure. Before planning, this pass scans artefact
//! states whose latest status is `failed` with `recoverable: true` and a
//! `providerRequestId`, probes the provider, and adopts completed outputs:
//! the bytes are downloaded, persisted through the blob store, and a
//! `succeeded` artefact event is appended with the same `inputsHash` as the
//! failed attempt, so the artefact is clean on the next plan without
//! re-invoking the producer.
//!
//! The pass is idempotent and appends zero events when nothing is
//! recoverable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use rf_blob::{BlobError, BlobStore};
use rf_core::{ArtefactEvent, ArtefactOutput, ArtefactStatus, Clock, Event};
use rf_events::{EventLog, EventLogError};
use rf_manifest::{ManifestError, ManifestService};
use rf_storage::{StorageContext, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by the recovery pre-pass.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Manifest service failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Event log failure.
    #[error(transparent)]
    Events(#[from] EventLogError),

    /// Blob store failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Provider-side state of a probed request.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    /// The request finished; its output is downloadable.
    Completed {
        /// Output URL.
        url: String,
        /// MIME type of the output.
        mime_type: String,
    },
    /// Still running on the provider side.
    InProgress,
    /// Still queued on the provider side.
    InQueue,
    /// Terminally failed on the provider side.
    Failed,
    /// The provider does not know the request.
    Unknown,
}

/// Injected probe for provider-side request status.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Query the provider for the state of a recorded request.
    async fn check_status(&self, provider: &str, request_id: &str)
        -> anyhow::Result<ProbeStatus>;
}

/// Downloads recovered output bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full body at a URL.
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// What the pre-pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Artefacts promoted to `succeeded`.
    pub adopted: Vec<String>,
    /// Artefacts still running or queued on the provider side.
    pub pending: Vec<String>,
    /// Artefacts probed but terminally failed or unknown.
    pub unrecovered: Vec<String>,
}

impl RecoveryReport {
    /// `true` when the pass changed nothing and nothing is pending.
    pub fn is_noop(&self) -> bool {
        self.adopted.is_empty() && self.pending.is_empty() && self.unrecovered.is_empty()
    }
}

/// The recovery pre-pass.
pub struct Recovery {
    ctx: StorageContext,
    manifest: ManifestService,
    events: EventLog,
    probe: Arc<dyn StatusProbe>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
}

impl Recovery {
    /// Create a pre-pass with an injected probe and fetcher.
    pub fn new(
        ctx: StorageContext,
        probe: Arc<dyn StatusProbe>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manifest: ManifestService::new(ctx.clone()),
            events: EventLog::new(ctx.clone()),
            probe,
            fetcher,
            clock,
            ctx,
        }
    }

    /// Probe every recoverable failed artefact and adopt completed outputs.
    pub async fn run(&self, movie_id: &str) -> Result<RecoveryReport, RecoveryError> {
        let pointer = self.manifest.pointer(movie_id).await?;
        let manifest = self.manifest.load(movie_id).await?;
        let Some(revision) = pointer.revision else {
            return Ok(RecoveryReport::default());
        };

        let blobs = BlobStore::new(self.ctx.clone(), movie_id);
        let mut report = RecoveryReport::default();
        let mut adopted_events = Vec::new();

        for (artefact_id, state) in &manifest.artefacts {
            if state.status != ArtefactStatus::Failed {
                continue;
            }
            let Some(diagnostics) = &state.diagnostics else {
                continue;
            };
            if !diagnostics.is_probeable() {
                continue;
            }
            let provider = diagnostics.provider.as_deref().unwrap_or_default();
            let request_id = diagnostics
                .provider_request_id
                .as_deref()
                .unwrap_or_default();

            let status = match self.probe.check_status(provider, request_id).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(
                        target: "rf.recovery",
                        artefact_id,
                        provider,
                        request_id,
                        error = %err,
                        "status probe failed, leaving artefact as-is"
                    );
                    report.unrecovered.push(artefact_id.clone());
                    continue;
                }
            };
            debug!(target: "rf.recovery", artefact_id, ?status, "probe result");

            match status {
                ProbeStatus::Completed { url, mime_type } => {
                    let bytes = match self.fetcher.fetch(&url).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(
                                target: "rf.recovery",
                                artefact_id,
                                url,
                                error = %err,
                                "download failed, leaving artefact as-is"
                            );
                            report.unrecovered.push(artefact_id.clone());
                            continue;
                        }
                    };
                    let blob_ref = blobs.persist(&bytes, &mime_type).await?;
                    let event = ArtefactEvent {
                        artefact_id: artefact_id.clone(),
                        produced_by: state.produced_by.clone(),
                        // Same inputsHash as the failed attempt, so the
                        // artefact is clean on the next plan.
                        inputs_hash: state.inputs_hash.clone(),
                        output: ArtefactOutput::from_blob(blob_ref),
                        status: ArtefactStatus::Succeeded,
                        diagnostics: None,
                        revision: revision.clone(),
                        at: self.clock.now(),
                    };
                    self.events.append_artefact(movie_id, &event).await?;
                    adopted_events.push(Event::Artefact(event));
                    report.adopted.push(artefact_id.clone());
                }
                ProbeStatus::InProgress | ProbeStatus::InQueue => {
                    report.pending.push(artefact_id.clone());
                }
                ProbeStatus::Failed | ProbeStatus::Unknown => {
                    report.unrecovered.push(artefact_id.clone());
                }
            }
        }

        if !adopted_events.is_empty() {
            self.manifest
                .materialize(movie_id, &revision, &adopted_events, self.clock.now())
                .await?;
        }
        info!(
            target: "rf.recovery",
            movie_id,
            adopted = report.adopted.len(),
            pending = report.pending.len(),
            unrecovered = report.unrecovered.len(),
            "recovery pre-pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rf_core::{Diagnostics, FixedClock};
    use rf_storage::MemoryStorage;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct MapProbe {
        statuses: BTreeMap<String, ProbeStatus>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusProbe for MapProbe {
        async fn check_status(
            &self,
            _provider: &str,
            request_id: &str,
        ) -> anyhow::Result<ProbeStatus> {
            self.calls.lock().unwrap().push(request_id.to_string());
            Ok(self
                .statuses
                .get(request_id)
                .cloned()
                .unwrap_or(ProbeStatus::Unknown))
        }
    }

    struct MapFetcher(BTreeMap<String, Vec<u8>>);

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404 for {url}"))
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            chrono::Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        ))
    }

    async fn seed_failed_artefact(
        ctx: &StorageContext,
        recoverable: bool,
        request_id: Option<&str>,
    ) -> ManifestService {
        let manifest = ManifestService::new(ctx.clone());
        manifest
            .init_pointer("m1", chrono::Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        let event = Event::Artefact(ArtefactEvent {
            artefact_id: "Artifact:Out".into(),
            produced_by: "Producer:P".into(),
            inputs_hash: "ih-original".into(),
            output: ArtefactOutput::default(),
            status: ArtefactStatus::Failed,
            diagnostics: Some(Diagnostics {
                provider: Some("fal".into()),
                model: Some("veo-3".into()),
                provider_request_id: request_id.map(str::to_string),
                recoverable: Some(recoverable),
                message: Some("timeout".into()),
                ..Diagnostics::default()
            }),
            revision: "rev-0001".into(),
            at: chrono::Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap(),
        });
        manifest
            .materialize(
                "m1",
                "rev-0001",
                &[event],
                chrono::Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        manifest
    }

    #[tokio::test]
    async fn adopts_completed_outputs() {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        let manifest = seed_failed_artefact(&ctx, true, Some("r1")).await;

        let probe = Arc::new(MapProbe {
            statuses: BTreeMap::from([(
                "r1".to_string(),
                ProbeStatus::Completed {
                    url: "https://cdn.example/out.mp4".into(),
                    mime_type: "video/mp4".into(),
                },
            )]),
            calls: Mutex::new(Vec::new()),
        });
        let fetcher = Arc::new(MapFetcher(BTreeMap::from([(
            "https://cdn.example/out.mp4".to_string(),
            b"xyz".to_vec(),
        )])));
        let recovery = Recovery::new(ctx.clone(), probe.clone(), fetcher, clock());

        let report = recovery.run("m1").await.unwrap();
        assert_eq!(report.adopted, vec!["Artifact:Out"]);
        assert!(report.pending.is_empty());

        let current = manifest.load("m1").await.unwrap();
        let state = &current.artefacts["Artifact:Out"];
        assert!(state.is_succeeded());
        assert_eq!(state.inputs_hash, "ih-original");
        let blob = state.blob.as_ref().unwrap();
        assert_eq!(blob.hash, rf_hash::hash_bytes(b"xyz"));

        // Idempotent: a second pass probes nothing.
        let second = recovery.run("m1").await.unwrap();
        assert!(second.is_noop());
        assert_eq!(probe.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_progress_reports_pending() {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        let _manifest = seed_failed_artefact(&ctx, true, Some("r1")).await;
        let probe = Arc::new(MapProbe {
            statuses: BTreeMap::from([("r1".to_string(), ProbeStatus::InProgress)]),
            calls: Mutex::new(Vec::new()),
        });
        let recovery = Recovery::new(
            ctx,
            probe,
            Arc::new(MapFetcher(BTreeMap::new())),
            clock(),
        );
        let report = recovery.run("m1").await.unwrap();
        assert_eq!(report.pending, vec!["Artifact:Out"]);
        assert!(report.adopted.is_empty());
    }

    #[tokio::test]
    async fn non_probeable_failures_are_ignored() {
        let ctx = StorageContext::new(Arc::new(MemoryStorage::new()), "movies");
        let _manifest = seed_failed_artefact(&ctx, false, Some("r1")).await;
        let probe = Arc::new(MapProbe {
            statuses: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let recovery = Recovery::new(
            ctx,
            probe.clone(),
            Arc::new(MapFetcher(BTreeMap::new())),
            clock(),
        );
        let report = recovery.run("m1").await.unwrap();
        assert!(report.is_noop());
        assert!(probe.calls.lock().unwrap().is_empty());
    }
}
