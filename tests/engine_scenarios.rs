// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios: plan + execute cycles against an in-memory
//! backend, exercising incremental rebuilds, surgical regeneration,
//! failure recovery, and validation rejection.

use async_trait::async_trait;
use reelforge::{
    Engine, EngineError, ErrorCode, ExecuteOptions, Handler, HandlerRegistry, InputValue,
    PlanOptions, ProbeStatus, Services, StatusProbe, SystemClock,
};
use rf_blob::BlobStore;
use rf_blueprint::{
    ArtefactDecl, Blueprint, Edge, Endpoint, InputDecl, PortType, ProducerSpec,
};
use rf_core::Diagnostics;
use rf_handler::{JobContext, ProducedArtefact, ProviderResult};
use rf_storage::{MemoryStorage, StorageContext};
use std::collections::BTreeMap;
use std::sync::Arc;

// ── helpers ──────────────────────────────────────────────────────────

/// Succeeds with deterministic inline bytes per artefact.
struct InlineHandler;

#[async_trait]
impl Handler for InlineHandler {
    async fn invoke(&self, ctx: JobContext) -> anyhow::Result<ProviderResult> {
        Ok(ProviderResult::succeeded(
            ctx.produces
                .iter()
                .map(|id| ProducedArtefact {
                    artefact_id: id.clone(),
                    inline: Some(rf_handler::InlineArtefact {
                        bytes: format!("bytes-of-{id}").into_bytes(),
                        mime_type: "video/mp4".into(),
                    }),
                    ..ProducedArtefact::default()
                })
                .collect(),
        ))
    }
}

/// Fails once with a recoverable provider error carrying a request id.
struct RecoverableFailureHandler;

#[async_trait]
impl Handler for RecoverableFailureHandler {
    async fn invoke(&self, _ctx: JobContext) -> anyhow::Result<ProviderResult> {
        Ok(ProviderResult::failed(Diagnostics {
            provider_request_id: Some("r1".into()),
            recoverable: Some(true),
            message: Some("provider timed out".into()),
            ..Diagnostics::default()
        }))
    }
}

struct FixedProbe(ProbeStatus);

#[async_trait]
impl StatusProbe for FixedProbe {
    async fn check_status(
        &self,
        _provider: &str,
        _request_id: &str,
    ) -> anyhow::Result<ProbeStatus> {
        Ok(self.0.clone())
    }
}

struct MapFetcher(BTreeMap<String, Vec<u8>>);

#[async_trait]
impl reelforge::Fetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no fixture for {url}"))
    }
}

fn backend() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new())
}

fn engine_over(backend: Arc<MemoryStorage>, registry: HandlerRegistry) -> Engine {
    Engine::new(Services::new(
        backend,
        "movies",
        Arc::new(registry),
        Arc::new(SystemClock),
    ))
}

fn inline_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("mock", rf_handler::GLOB, rf_handler::GLOB, InlineHandler);
    registry
}

/// One producer `P` from `Input:Prompt` to `Artifact:Out`.
fn simple_blueprint() -> Blueprint {
    let mut bp = Blueprint::new();
    let root = bp.root();
    bp.add_input(root, InputDecl::new("Prompt", PortType::Text));
    bp.add_artefact(root, ArtefactDecl::new("Out", PortType::Video));
    bp.add_producer(
        root,
        ProducerSpec {
            provider: Some("mock".into()),
            provider_model: Some("m1".into()),
            inputs: vec![InputDecl::new("prompt", PortType::Text)],
            artefacts: vec![ArtefactDecl::new("clip", PortType::Video)],
            ..ProducerSpec::named("P")
        },
    );
    bp.add_edge(
        root,
        Edge::new(
            Endpoint::Input {
                key: "Prompt".into(),
            },
            Endpoint::ProducerPort {
                producer: "P".into(),
                port: "prompt".into(),
            },
        ),
    );
    bp.add_edge(
        root,
        Edge::new(
            Endpoint::ProducerOutput {
                producer: "P".into(),
                output: "clip".into(),
            },
            Endpoint::Artefact { name: "Out".into() },
        ),
    );
    bp
}

/// Chain `A -> B -> C`.
fn chain_blueprint() -> Blueprint {
    let mut bp = Blueprint::new();
    let root = bp.root();
    let leaf = |name: &str, port: &str| ProducerSpec {
        provider: Some("mock".into()),
        provider_model: Some("m1".into()),
        inputs: vec![InputDecl::new(port, PortType::Any)],
        artefacts: vec![ArtefactDecl::new("out", PortType::Any)],
        ..ProducerSpec::named(name)
    };
    bp.add_producer(root, leaf("A", "seed"));
    bp.add_producer(root, leaf("B", "in"));
    bp.add_producer(root, leaf("C", "in"));
    for (from, to) in [("A", "B"), ("B", "C")] {
        bp.add_edge(
            root,
            Edge::new(
                Endpoint::ProducerOutput {
                    producer: from.into(),
                    output: "out".into(),
                },
                Endpoint::ProducerPort {
                    producer: to.into(),
                    port: "in".into(),
                },
            ),
        );
    }
    bp
}

fn prompt(value: &str) -> BTreeMap<String, InputValue> {
    BTreeMap::from([(
        "Input:Prompt".to_string(),
        InputValue::scalar(serde_json::json!(value)),
    )])
}

// ── Scenario A: cold first run ───────────────────────────────────────

#[tokio::test]
async fn scenario_a_cold_first_run() {
    let backend = backend();
    let engine = engine_over(backend.clone(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();

    let bp = simple_blueprint();
    let outcome = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.plan.revision, "rev-0001");
    assert_eq!(outcome.plan.job_count(), 1);

    let report = engine
        .execute("m1", &outcome.plan, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.succeeded, vec!["Producer:P"]);

    // One input event with the canonical hash of "hi".
    let stats = engine.event_stats("m1").await.unwrap();
    assert_eq!(stats.input_events, 1);
    assert_eq!(stats.artefact_events, 1);

    let manifest = engine.current_manifest("m1").await.unwrap();
    assert_eq!(manifest.revision.as_deref(), Some("rev-0001"));
    assert_eq!(
        manifest.inputs["Input:Prompt"].hash,
        rf_hash::hash_value(&serde_json::json!("hi"))
    );
    let state = &manifest.artefacts["Artifact:Out"];
    assert!(state.is_succeeded());

    // The blob is readable by its hash.
    let blob_ref = state.blob.clone().unwrap();
    let blobs = BlobStore::new(StorageContext::new(backend, "movies"), "m1");
    assert_eq!(
        blobs.read(&blob_ref).await.unwrap(),
        b"bytes-of-Artifact:Out"
    );
}

// ── Scenario B: no-op re-plan ────────────────────────────────────────

#[tokio::test]
async fn scenario_b_noop_replan() {
    let engine = engine_over(backend(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();
    let bp = simple_blueprint();
    let first = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    engine
        .execute("m1", &first.plan, &ExecuteOptions::default())
        .await
        .unwrap();

    let stats_before = engine.event_stats("m1").await.unwrap();
    let manifest_before = engine.current_manifest("m1").await.unwrap();

    let second = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    assert!(second.plan.is_empty());
    assert_eq!(second.appended_events, 0);
    assert_eq!(engine.event_stats("m1").await.unwrap(), stats_before);
    assert_eq!(engine.current_manifest("m1").await.unwrap(), manifest_before);
}

// ── Scenario C: input change ─────────────────────────────────────────

#[tokio::test]
async fn scenario_c_input_change() {
    let engine = engine_over(backend(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();
    let bp = simple_blueprint();
    let first = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    engine
        .execute("m1", &first.plan, &ExecuteOptions::default())
        .await
        .unwrap();

    let outcome = engine
        .plan("m1", &bp, &prompt("bye"), &PlanOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.plan.job_count(), 1);
    assert_eq!(outcome.explanation.dirty_inputs, vec!["Input:Prompt"]);
    let reasons = &outcome.explanation.job_reasons["Producer:P"];
    assert!(reasons.iter().any(|r| matches!(
        r,
        rf_planner::DirtyReason::TouchesDirtyInput { input } if input == "Input:Prompt"
    )));
}

// ── Scenario D: surgical regeneration ────────────────────────────────

#[tokio::test]
async fn scenario_d_surgical_regeneration() {
    let engine = engine_over(backend(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();
    let bp = chain_blueprint();
    let seed = BTreeMap::from([(
        "Input:A.seed".to_string(),
        InputValue::scalar(serde_json::json!("s")),
    )]);
    let first = engine
        .plan("m1", &bp, &seed, &PlanOptions::default())
        .await
        .unwrap();
    let report = engine
        .execute("m1", &first.plan, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.succeeded.len(), 3);

    let options = PlanOptions {
        artifact_ids: vec!["Artifact:B.out".into()],
        ..PlanOptions::default()
    };
    let outcome = engine.plan("m1", &bp, &seed, &options).await.unwrap();
    let job_ids: Vec<&str> = outcome.plan.jobs().map(|j| j.job_id.as_str()).collect();
    assert_eq!(job_ids, vec!["Producer:B"]);
}

// ── Scenario E: failure + recovery ───────────────────────────────────

#[tokio::test]
async fn scenario_e_failure_and_recovery() {
    let backend = backend();
    let mut registry = HandlerRegistry::new();
    registry.register(
        "mock",
        rf_handler::GLOB,
        rf_handler::GLOB,
        RecoverableFailureHandler,
    );
    let engine = engine_over(backend.clone(), registry).with_recovery(
        Arc::new(FixedProbe(ProbeStatus::Completed {
            url: "https://cdn.example/out.mp4".into(),
            mime_type: "video/mp4".into(),
        })),
        Arc::new(MapFetcher(BTreeMap::from([(
            "https://cdn.example/out.mp4".to_string(),
            b"xyz".to_vec(),
        )]))),
    );
    engine.init_movie("m1", None).await.unwrap();

    let bp = simple_blueprint();
    let first = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    let report = engine
        .execute("m1", &first.plan, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed, vec!["Producer:P"]);

    // The next plan runs the recovery pre-pass: the artefact is adopted
    // and no job is re-planned.
    let second = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap();
    assert!(second.plan.is_empty());

    let manifest = engine.current_manifest("m1").await.unwrap();
    let state = &manifest.artefacts["Artifact:Out"];
    assert!(state.is_succeeded());
    assert_eq!(
        state.blob.as_ref().unwrap().hash,
        rf_hash::hash_bytes(b"xyz")
    );
}

// ── Scenario F: validation rejection ─────────────────────────────────

#[tokio::test]
async fn scenario_f_validation_rejection() {
    let engine = engine_over(backend(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();

    let mut bp = simple_blueprint();
    let root = bp.root();
    bp.add_edge(
        root,
        Edge::new(
            Endpoint::Input {
                key: "Prompt".into(),
            },
            Endpoint::ProducerPort {
                producer: "P".into(),
                port: "NonExistentInput".into(),
            },
        ),
    );

    let err: EngineError = engine
        .plan("m1", &bp, &prompt("hi"), &PlanOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PlanValidationFailed);
    // The message leads with a stable V-code: `V\d{3}:`.
    let message = err.message.clone();
    let code: String = message.chars().take(4).collect();
    assert!(code.starts_with('V'), "message: {message}");
    assert!(code[1..].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(message.chars().nth(4), Some(':'));

    // No plan file was written.
    assert!(matches!(
        engine.load_plan("m1", Some("rev-0001")).await,
        Err(EngineError {
            code: ErrorCode::PlanNotFound,
            ..
        })
    ));
}

// ── Event-log replay determinism ─────────────────────────────────────

#[tokio::test]
async fn replayed_manifest_matches_materialized_state() {
    let backend = backend();
    let engine = engine_over(backend.clone(), inline_registry());
    engine.init_movie("m1", None).await.unwrap();
    let bp = simple_blueprint();
    for value in ["hi", "bye", "again"] {
        let outcome = engine
            .plan("m1", &bp, &prompt(value), &PlanOptions::default())
            .await
            .unwrap();
        engine
            .execute("m1", &outcome.plan, &ExecuteOptions::default())
            .await
            .unwrap();
    }
    let materialized = engine.current_manifest("m1").await.unwrap();
    let replayed = rf_manifest::ManifestService::new(StorageContext::new(backend, "movies"))
        .materialize_from_log("m1")
        .await
        .unwrap();
    assert_eq!(replayed.inputs, materialized.inputs);
    assert_eq!(replayed.artefacts, materialized.artefacts);
}
