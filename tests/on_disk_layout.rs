// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk layout checks against the local filesystem backend: the
//! storage skeleton a plan/execute cycle leaves behind, and the exact
//! paths other tools rely on.

use async_trait::async_trait;
use reelforge::{
    Engine, ExecuteOptions, Handler, HandlerRegistry, InputValue, PlanOptions, Services,
    SystemClock,
};
use rf_blueprint::{ArtefactDecl, Blueprint, Edge, Endpoint, InputDecl, PortType, ProducerSpec};
use rf_handler::{JobContext, ProducedArtefact, ProviderResult};
use rf_storage::LocalStorage;
use std::collections::BTreeMap;
use std::sync::Arc;

struct PngHandler;

#[async_trait]
impl Handler for PngHandler {
    async fn invoke(&self, ctx: JobContext) -> anyhow::Result<ProviderResult> {
        Ok(ProviderResult::succeeded(
            ctx.produces
                .iter()
                .map(|id| ProducedArtefact {
                    artefact_id: id.clone(),
                    inline: Some(rf_handler::InlineArtefact {
                        bytes: b"png-bytes".to_vec(),
                        mime_type: "image/png".into(),
                    }),
                    ..ProducedArtefact::default()
                })
                .collect(),
        ))
    }
}

fn blueprint() -> Blueprint {
    let mut bp = Blueprint::new();
    let root = bp.root();
    bp.add_input(root, InputDecl::new("Prompt", PortType::Text));
    bp.add_artefact(root, ArtefactDecl::new("Out", PortType::Image));
    bp.add_producer(
        root,
        ProducerSpec {
            provider: Some("mock".into()),
            provider_model: Some("m1".into()),
            inputs: vec![InputDecl::new("prompt", PortType::Text)],
            artefacts: vec![ArtefactDecl::new("frame", PortType::Image)],
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
                output: "frame".into(),
            },
            Endpoint::Artefact { name: "Out".into() },
        ),
    );
    bp
}

#[tokio::test]
async fn plan_execute_cycle_leaves_the_documented_layout() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register("mock", rf_handler::GLOB, rf_handler::GLOB, PngHandler);
    let engine = Engine::new(Services::new(
        Arc::new(LocalStorage::new(dir.path())),
        "movies",
        Arc::new(registry),
        Arc::new(SystemClock),
    ));

    engine.init_movie("trailer-042", None).await.unwrap();
    let inputs = BTreeMap::from([(
        "Input:Prompt".to_string(),
        InputValue::scalar(serde_json::json!("rainy street")),
    )]);
    let outcome = engine
        .plan("trailer-042", &blueprint(), &inputs, &PlanOptions::default())
        .await
        .unwrap();
    engine
        .execute("trailer-042", &outcome.plan, &ExecuteOptions::default())
        .await
        .unwrap();

    let movie_root = dir.path().join("movies").join("trailer-042");
    let file = |rel: &str| movie_root.join(rel);
    for rel in [
        "current.json",
        "metadata.json",
        "manifests/rev-0001.json",
        "runs/rev-0001-plan.json",
        "events/inputs.log",
        "events/artefacts.log",
    ] {
        assert!(file(rel).is_file(), "missing {rel}");
    }

    // The blob lands under its two-character hash shard with a mapped
    // extension.
    let hash = rf_hash::hash_bytes(b"png-bytes");
    let blob_path = file(&format!("blobs/{}/{hash}.png", &hash[..2]));
    assert!(blob_path.is_file(), "missing blob at {blob_path:?}");

    // The event logs are NDJSON: one JSON object per line.
    let inputs_log = std::fs::read_to_string(file("events/inputs.log")).unwrap();
    assert_eq!(inputs_log.lines().count(), 1);
    let record: serde_json::Value = serde_json::from_str(inputs_log.lines().next().unwrap()).unwrap();
    assert_eq!(record["type"], "input");
    assert_eq!(record["inputId"], "Input:Prompt");

    // The current pointer dereferences to the materialized manifest.
    let pointer: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(file("current.json")).unwrap()).unwrap();
    assert_eq!(pointer["revision"], "rev-0001");
    assert_eq!(pointer["manifestPath"], "manifests/rev-0001.json");
    assert!(pointer["hash"].is_string());

    // Teardown removes the whole movie directory.
    engine.delete_movie("trailer-042").await.unwrap();
    assert!(!movie_root.exists());
    drop(dir);
}

/// Layout check for the plan wire format consumed by external tools.
#[tokio::test]
async fn persisted_plan_matches_the_wire_format() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register("mock", rf_handler::GLOB, rf_handler::GLOB, PngHandler);
    let engine = Engine::new(Services::new(
        Arc::new(LocalStorage::new(dir.path())),
        "movies",
        Arc::new(registry),
        Arc::new(SystemClock),
    ));
    engine.init_movie("m1", None).await.unwrap();
    let inputs = BTreeMap::from([(
        "Input:Prompt".to_string(),
        InputValue::scalar(serde_json::json!("x")),
    )]);
    engine
        .plan("m1", &blueprint(), &inputs, &PlanOptions::default())
        .await
        .unwrap();

    let raw = std::fs::read_to_string(
        dir.path().join("movies/m1/runs/rev-0001-plan.json"),
    )
    .unwrap();
    let plan: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(plan["revision"], "rev-0001");
    assert_eq!(plan["blueprintLayerCount"], 1);
    let job = &plan["layers"][0][0];
    assert_eq!(job["jobId"], "Producer:P");
    assert_eq!(job["producer"], "P");
    assert_eq!(job["provider"], "mock");
    assert_eq!(job["providerModel"], "m1");
    assert_eq!(job["inputs"], serde_json::json!(["Input:Prompt"]));
    assert_eq!(job["produces"], serde_json::json!(["Artifact:Out"]));
    assert_eq!(job["context"]["inputBindings"]["prompt"], "Input:Prompt");
    assert_eq!(job["attempt"], 1);
    assert!(plan["createdAt"].is_string());
    // A fresh movie plans against no prior manifest.
    assert!(plan["manifestBaseHash"].is_null());
}
