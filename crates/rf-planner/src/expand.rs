// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blueprint expansion into concrete job instances.
//!
//! Expansion resolves every edge to canonical ids, follows input chains
//! through namespace boundaries, applies artefact re-exports, evaluates
//! condition gates against the current values, and unrolls loop dimensions
//! into one job per index. Collectors expand into engine-evaluated jobs
//! (`provider: "builtin"`, model `"collect"`).

use crate::PlannerError;
use rf_blueprint::{Blueprint, CollectorDecl, CountSource, Edge, Endpoint, NodeId, ProducerNode};
use rf_core::{Job, JobInvocationContext};
use rf_id::{ArtifactId, InputId, ProducerId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Provider name of engine-evaluated jobs.
pub const BUILTIN_PROVIDER: &str = "builtin";
/// Model name of collector jobs.
pub const COLLECT_MODEL: &str = "collect";

/// A fully resolved job plus its scheduling metadata.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// The wire-format job.
    pub job: Job,
    /// Blueprint layer index (longest producer path from any root).
    pub layer: usize,
    /// Subset of `job.inputs` that are artefact ids.
    pub consumed_artefacts: Vec<String>,
}

/// The result of expanding a blueprint against current values.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Job instances in deterministic (layer, job id) order.
    pub jobs: Vec<JobInstance>,
    /// Total layer count of the blueprint.
    pub layer_count: usize,
}

/// Values visible at planning time: prior manifest inputs overlaid with the
/// inputs provided for this pass. Used to resolve loop counts and condition
/// gates.
pub(crate) struct PlanningValues {
    values: BTreeMap<String, Value>,
}

impl PlanningValues {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    fn count(&self, source: &CountSource, producer: &str) -> Result<u64, PlannerError> {
        match source {
            CountSource::Const(n) => Ok(*n),
            CountSource::Input(id) => match self.get(id) {
                Some(Value::Number(n)) => n.as_u64().ok_or_else(|| PlannerError::BadCount {
                    producer: producer.to_string(),
                    source: id.clone(),
                    detail: format!("expected a non-negative integer, got {n}"),
                }),
                Some(other) => Err(PlannerError::BadCount {
                    producer: producer.to_string(),
                    source: id.clone(),
                    detail: format!("expected a non-negative integer, got {other}"),
                }),
                None => Err(PlannerError::BadCount {
                    producer: producer.to_string(),
                    source: id.clone(),
                    detail: "no value available".into(),
                }),
            },
        }
    }

    fn condition(&self, id: &str, name: &str) -> Result<bool, PlannerError> {
        match self.get(id) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(PlannerError::BadCondition {
                condition: name.to_string(),
                detail: format!("source `{id}` is not boolean: {other}"),
            }),
            None => Err(PlannerError::BadCondition {
                condition: name.to_string(),
                detail: format!("source `{id}` has no value"),
            }),
        }
    }
}

/// Expand a validated blueprint into job instances.
pub(crate) fn expand(bp: &Blueprint, values: &PlanningValues) -> Result<Expansion, PlannerError> {
    let wiring = Wiring::build(bp, values)?;

    let mut units = Vec::new();
    for (id, node) in bp.leaf_producers() {
        units.push(wiring.producer_unit(bp, id, node, values)?);
    }
    for (id, node) in bp.nodes() {
        for collector in &node.collectors {
            units.push(wiring.collector_unit(bp, id, node, collector, values)?);
        }
    }

    // Layer = longest dependency path over produced ids.
    let producer_of: BTreeMap<&str, usize> = units
        .iter()
        .enumerate()
        .flat_map(|(i, u)| u.produces.iter().map(move |p| (p.as_str(), i)))
        .collect();
    let mut layers = vec![usize::MAX; units.len()];
    let mut visiting = BTreeSet::new();
    for i in 0..units.len() {
        unit_depth(i, &units, &producer_of, &mut layers, &mut visiting);
    }
    let layer_count = layers.iter().map(|&l| l + 1).max().unwrap_or(0);

    // Loop symbol per produced id, for index-aligned consumption.
    let mut loop_of: BTreeMap<String, String> = BTreeMap::new();
    for unit in &units {
        if let Some((symbol, _)) = &unit.loop_dim {
            for produced in &unit.produces {
                loop_of.insert(produced.clone(), symbol.clone());
            }
        }
    }

    let mut jobs = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        jobs.extend(instantiate(unit, layers[i], &loop_of));
    }
    jobs.sort_by(|a, b| (a.layer, a.job.job_id.clone()).cmp(&(b.layer, b.job.job_id.clone())));
    Ok(Expansion { jobs, layer_count })
}

fn unit_depth(
    i: usize,
    units: &[Unit],
    producer_of: &BTreeMap<&str, usize>,
    layers: &mut [usize],
    visiting: &mut BTreeSet<usize>,
) -> usize {
    if layers[i] != usize::MAX {
        return layers[i];
    }
    if !visiting.insert(i) {
        // Cycles are rejected by the validator; bound the recursion anyway.
        return 0;
    }
    let mut layer = 0;
    for (_, source) in &units[i].bindings {
        if let Some(&dep) = producer_of.get(source.as_str()) {
            if dep != i {
                layer = layer.max(1 + unit_depth(dep, units, producer_of, layers, visiting));
            }
        }
    }
    visiting.remove(&i);
    layers[i] = layer;
    layer
}

/// Internal unit of scheduling before loop unrolling: a leaf producer or a
/// collector.
struct Unit {
    alias: String,
    provider: String,
    model: String,
    provider_options: Value,
    rate_key: String,
    /// Port name to unindexed canonical source id.
    bindings: Vec<(String, String)>,
    /// Unindexed produced ids, one per output.
    produces: Vec<String>,
    /// Loop symbol and count, when the unit is index-expanded.
    loop_dim: Option<(String, u64)>,
    /// For collectors: the loop count of the collected producer.
    collect_count: Option<u64>,
}

fn instantiate(unit: &Unit, layer: usize, loop_of: &BTreeMap<String, String>) -> Vec<JobInstance> {
    let indices: Vec<Option<u64>> = match &unit.loop_dim {
        Some((_, count)) => (0..*count).map(Some).collect(),
        None => vec![None],
    };

    indices
        .into_iter()
        .map(|index| {
            let job_id = match index {
                Some(i) => ProducerId::new(&unit.alias).indexed(i).to_string(),
                None => ProducerId::new(&unit.alias).to_string(),
            };
            let mut inputs = Vec::new();
            let mut bindings = BTreeMap::new();
            for (port, source) in &unit.bindings {
                bindings.insert(port.clone(), source.clone());
                match unit.collect_count {
                    // Collectors consume every index of the collected output.
                    Some(count) => {
                        for i in 0..count {
                            inputs.push(indexed_id(source, i));
                        }
                    }
                    None => {
                        // Index-aligned consumption: a looped unit consuming
                        // a looped source reads its own index (the validator
                        // guarantees the cardinality sources agree).
                        let resolved = match (index, loop_of.get(source.as_str())) {
                            (Some(i), Some(_)) => {
                                bindings.insert(port.clone(), indexed_id(source, i));
                                indexed_id(source, i)
                            }
                            _ => source.clone(),
                        };
                        inputs.push(resolved);
                    }
                }
            }
            inputs.sort();
            inputs.dedup();
            let produces: Vec<String> = unit
                .produces
                .iter()
                .map(|p| match index {
                    Some(i) => indexed_id(p, i),
                    None => p.clone(),
                })
                .collect();
            let consumed_artefacts = inputs
                .iter()
                .filter(|i| rf_id::is_artifact_id(i))
                .cloned()
                .collect();
            JobInstance {
                job: Job {
                    job_id,
                    producer: unit.alias.clone(),
                    provider: unit.provider.clone(),
                    provider_model: unit.model.clone(),
                    inputs,
                    produces,
                    context: JobInvocationContext {
                        input_bindings: bindings,
                        provider_options: unit.provider_options.clone(),
                        rate_key: unit.rate_key.clone(),
                    },
                    attempt: 1,
                },
                layer,
                consumed_artefacts,
            }
        })
        .collect()
}

fn indexed_id(id: &str, index: u64) -> String {
    format!("{id}[{index}]")
}

/// Resolved wiring: port feeds, input chains through namespaces, and
/// artefact exports.
struct Wiring {
    /// `(producer alias, port)` to its source id, for leaf producers.
    port_feed: BTreeMap<(String, String), String>,
    /// `Input:<ns>.<port>` to its upstream source id, for namespaces.
    input_chain: BTreeMap<String, String>,
    /// Default produced id to its exported (re-declared) id.
    exports: BTreeMap<String, String>,
}

impl Wiring {
    fn build(bp: &Blueprint, values: &PlanningValues) -> Result<Self, PlannerError> {
        let mut port_feed = BTreeMap::new();
        let mut input_chain = BTreeMap::new();
        let mut exports = BTreeMap::new();
        for (scope, node) in bp.nodes() {
            for edge in &node.edges {
                if !edge_taken(node, edge, values)? {
                    continue;
                }
                let Some(source) = source_id(bp, scope, node, &edge.from) else {
                    continue;
                };
                match &edge.to {
                    Endpoint::ProducerPort { producer, port } => {
                        let Some(child) = bp.child_by_name(scope, producer) else {
                            continue;
                        };
                        let child_alias = bp.node(child).alias.clone();
                        if bp.node(child).is_leaf_producer() {
                            port_feed.insert((child_alias, port.clone()), source);
                        } else {
                            let target = InputId::new(child_alias, port.clone()).to_string();
                            input_chain.insert(target, source);
                        }
                    }
                    Endpoint::Artefact { name } => {
                        let exported =
                            ArtifactId::new(node.alias.clone(), name.clone()).to_string();
                        exports.insert(source, exported);
                    }
                    _ => {}
                }
            }
        }
        Ok(Self {
            port_feed,
            input_chain,
            exports,
        })
    }

    /// Follow namespace input chains, then artefact exports.
    fn resolve(&self, id: &str) -> String {
        let mut current = id.to_string();
        for _ in 0..64 {
            if let Some(next) = self.input_chain.get(&current) {
                current = next.clone();
                continue;
            }
            if let Some(next) = self.exports.get(&current) {
                current = next.clone();
                continue;
            }
            break;
        }
        current
    }

    fn producer_unit(
        &self,
        bp: &Blueprint,
        id: NodeId,
        node: &ProducerNode,
        values: &PlanningValues,
    ) -> Result<Unit, PlannerError> {
        let eff = bp
            .effective(id)
            .map(|eff| EffectiveView {
                provider: eff.provider.to_string(),
                model: eff.provider_model.to_string(),
                provider_options: eff.provider_options.clone(),
                rate_key: eff.rate_key,
                input_names: eff.inputs.iter().map(|d| d.name.clone()).collect(),
                output_names: eff.outputs.iter().map(|d| d.name.clone()).collect(),
            })
            .ok_or_else(|| PlannerError::UnresolvableProducer {
                producer: node.alias.clone(),
            })?;
        let mut bindings = Vec::new();
        for port in eff.input_names {
            let source = match self.port_feed.get(&(node.alias.clone(), port.clone())) {
                Some(source) => self.resolve(source),
                None => self.resolve(&InputId::new(node.alias.clone(), port.clone()).to_string()),
            };
            bindings.push((port, source));
        }
        let produces = eff
            .output_names
            .into_iter()
            .map(|out| self.resolve(&ArtifactId::new(node.alias.clone(), out).to_string()))
            .collect();
        let loop_dim = match &node.loop_spec {
            Some(spec) => Some((spec.symbol.clone(), values.count(&spec.count, &node.alias)?)),
            None => None,
        };
        Ok(Unit {
            alias: node.alias.clone(),
            provider: eff.provider,
            model: eff.model,
            provider_options: eff.provider_options,
            rate_key: eff.rate_key,
            bindings,
            produces,
            loop_dim,
            collect_count: None,
        })
    }

    fn collector_unit(
        &self,
        bp: &Blueprint,
        scope: NodeId,
        node: &ProducerNode,
        collector: &CollectorDecl,
        values: &PlanningValues,
    ) -> Result<Unit, PlannerError> {
        let alias = rf_id::format_producer_alias(&node.alias, &collector.name);
        let mut bindings = Vec::new();
        let mut count = 0u64;
        for edge in &node.edges {
            let Endpoint::Collector { name } = &edge.to else {
                continue;
            };
            if name != &collector.name {
                continue;
            }
            let Endpoint::ProducerOutput { producer, output } = &edge.from else {
                continue;
            };
            let Some(child) = bp.child_by_name(scope, producer) else {
                continue;
            };
            let child_node = bp.node(child);
            let default = ArtifactId::new(child_node.alias.clone(), output.clone()).to_string();
            bindings.push((collector.name.clone(), self.resolve(&default)));
            if let Some(spec) = &child_node.loop_spec {
                count = count.max(values.count(&spec.count, &child_node.alias)?);
            }
        }
        let produces = vec![self
            .resolve(&ArtifactId::new(node.alias.clone(), collector.name.clone()).to_string())];
        Ok(Unit {
            alias,
            provider: BUILTIN_PROVIDER.into(),
            model: COLLECT_MODEL.into(),
            provider_options: Value::Null,
            rate_key: BUILTIN_PROVIDER.into(),
            bindings,
            produces,
            loop_dim: None,
            collect_count: Some(count),
        })
    }
}

/// Flattened effective producer data, owned so units outlive borrows.
struct EffectiveView {
    provider: String,
    model: String,
    provider_options: Value,
    rate_key: String,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

/// Whether an edge's condition gate (if any) evaluates true.
fn edge_taken(
    node: &ProducerNode,
    edge: &Edge,
    values: &PlanningValues,
) -> Result<bool, PlannerError> {
    let Some(condition) = &edge.condition else {
        return Ok(true);
    };
    let Some(decl) = node.conditions.iter().find(|c| &c.name == condition) else {
        // Validator reports V005; skip the edge here.
        return Ok(false);
    };
    let source = InputId::new(node.alias.clone(), decl.source.clone()).to_string();
    values.condition(&source, condition)
}

/// Canonical id of an edge source within a scope, before chain resolution.
fn source_id(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    endpoint: &Endpoint,
) -> Option<String> {
    match endpoint {
        Endpoint::Input { key } => Some(InputId::new(node.alias.clone(), key.clone()).to_string()),
        Endpoint::ProducerOutput { producer, output } => {
            let child = bp.child_by_name(scope, producer)?;
            Some(ArtifactId::new(bp.node(child).alias.clone(), output.clone()).to_string())
        }
        Endpoint::Collector { name } => {
            Some(ArtifactId::new(node.alias.clone(), name.clone()).to_string())
        }
        Endpoint::Condition { name } => {
            let decl = node.conditions.iter().find(|c| &c.name == name)?;
            Some(InputId::new(node.alias.clone(), decl.source.clone()).to_string())
        }
        Endpoint::Artefact { name } => {
            Some(ArtifactId::new(node.alias.clone(), name.clone()).to_string())
        }
        Endpoint::ProducerPort { .. } => None,
    }
}
