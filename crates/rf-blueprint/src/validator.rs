// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blueprint validation.
//!
//! Every check runs; the result aggregates the union of issues rather than
//! short-circuiting on the first failure. Codes are stable:
//!
//! - `V001`: edge endpoint missing or not connectable
//! - `V002`: port outside a producer's declared schema
//! - `V003`: loop dimension without a concrete count source
//! - `V004`: collector arity or loop-symbol violation
//! - `V005`: condition missing or not boolean
//! - `V006`: connection type mismatch
//! - `V007`: cycle through producers
//! - `V008`: inconsistent loop dimensions feeding one producer
//! - `W001`/`W002`/`W003`: unused inputs, unused artefacts, unreachable
//!   producers (warnings)

use crate::{
    ArtefactDecl, Blueprint, CountSource, Edge, Endpoint, InputDecl, NodeId, PortType,
    ProducerNode,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Stable code (`V001`…, `W001`…).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Dotted alias of the scope the issue was found in.
    pub scope: String,
}

impl ValidationIssue {
    fn new(code: &'static str, scope: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            scope: scope.to_string(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{}: [{}] {}", self.code, self.scope, self.message)
        }
    }
}

/// Aggregated validation findings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// Hard errors; planning refuses to run while any exist.
    pub errors: Vec<ValidationIssue>,
    /// Advisory findings.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// `true` when no errors were found.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, code: &'static str, scope: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(code, scope, message));
    }

    fn warn(&mut self, code: &'static str, scope: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(code, scope, message));
    }
}

/// Run every check against the blueprint.
pub fn validate(bp: &Blueprint) -> ValidationResult {
    let mut result = ValidationResult::default();
    for (id, node) in bp.nodes() {
        check_import_refs(bp, node, &mut result);
        check_loop_counts(node, &mut result);
        for edge in &node.edges {
            check_edge(bp, id, node, edge, &mut result);
        }
        check_collectors(bp, id, node, &mut result);
        check_cycles(node, &mut result);
        check_dimensions(bp, id, node, &mut result);
        check_unused(bp, node, &mut result);
    }
    result
}

// -- individual checks ------------------------------------------------------

fn check_import_refs(bp: &Blueprint, node: &ProducerNode, result: &mut ValidationResult) {
    if let Some(import_ref) = &node.import_ref {
        if bp.import(import_ref).is_none() {
            result.error(
                "V002",
                &node.alias,
                format!("unknown producer import `{import_ref}`"),
            );
        }
    }
}

fn check_loop_counts(node: &ProducerNode, result: &mut ValidationResult) {
    let Some(loop_spec) = &node.loop_spec else {
        return;
    };
    match &loop_spec.count {
        CountSource::Const(_) => {}
        CountSource::Input(id) => {
            if !rf_id::is_input_id(id) {
                result.error(
                    "V003",
                    &node.alias,
                    format!(
                        "loop `{}` count source `{id}` is not a canonical input id",
                        loop_spec.symbol
                    ),
                );
            }
        }
    }
}

/// Declared input ports of a child, seen from its parent scope.
fn child_inputs<'a>(bp: &'a Blueprint, child: NodeId) -> Vec<&'a InputDecl> {
    match bp.effective(child) {
        Some(eff) => eff.inputs,
        None => bp.node(child).inputs.iter().collect(),
    }
}

/// Declared outputs of a child, seen from its parent scope.
fn child_outputs<'a>(bp: &'a Blueprint, child: NodeId) -> Vec<&'a ArtefactDecl> {
    match bp.effective(child) {
        Some(eff) => eff.outputs,
        None => bp.node(child).artefacts.iter().collect(),
    }
}

/// Type of an endpoint used as an edge source, when statically known.
fn source_type(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    endpoint: &Endpoint,
) -> Option<PortType> {
    match endpoint {
        Endpoint::Input { key } => node
            .inputs
            .iter()
            .find(|d| &d.name == key)
            .map(|d| d.ty.clone()),
        Endpoint::ProducerOutput { producer, output } => {
            let child = bp.child_by_name(scope, producer)?;
            child_outputs(bp, child)
                .into_iter()
                .find(|d| &d.name == output)
                .map(|d| d.ty.clone())
        }
        Endpoint::Collector { name } => node
            .collectors
            .iter()
            .find(|c| &c.name == name)
            .map(|c| PortType::List(Box::new(c.ty.clone()))),
        Endpoint::Condition { .. } => Some(PortType::Boolean),
        Endpoint::Artefact { name } => node
            .artefacts
            .iter()
            .find(|d| &d.name == name)
            .map(|d| d.ty.clone()),
        Endpoint::ProducerPort { .. } => None,
    }
}

/// Type of an endpoint used as an edge target, when statically known.
fn target_type(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    endpoint: &Endpoint,
) -> Option<PortType> {
    match endpoint {
        Endpoint::ProducerPort { producer, port } => {
            let child = bp.child_by_name(scope, producer)?;
            child_inputs(bp, child)
                .into_iter()
                .find(|d| &d.name == port)
                .map(|d| d.ty.clone())
        }
        Endpoint::Artefact { name } => node
            .artefacts
            .iter()
            .find(|d| &d.name == name)
            .map(|d| d.ty.clone()),
        Endpoint::Collector { name } => node
            .collectors
            .iter()
            .find(|c| &c.name == name)
            .map(|c| c.ty.clone()),
        _ => None,
    }
}

fn check_edge(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    edge: &Edge,
    result: &mut ValidationResult,
) {
    // Source endpoint existence and direction.
    match &edge.from {
        Endpoint::Input { key } => {
            if !node.inputs.iter().any(|d| &d.name == key) {
                result.error("V001", &node.alias, format!("edge source input `{key}` is not declared"));
            }
        }
        Endpoint::ProducerOutput { producer, output } => match bp.child_by_name(scope, producer) {
            None => result.error(
                "V001",
                &node.alias,
                format!("edge source producer `{producer}` does not exist"),
            ),
            Some(child) => {
                if !child_outputs(bp, child).iter().any(|d| &d.name == output) {
                    result.error(
                        "V002",
                        &node.alias,
                        format!("producer `{producer}` declares no output `{output}`"),
                    );
                }
            }
        },
        Endpoint::Collector { name } => {
            if !node.collectors.iter().any(|c| &c.name == name) {
                result.error(
                    "V001",
                    &node.alias,
                    format!("edge source collector `{name}` is not declared"),
                );
            }
        }
        Endpoint::Condition { name } => {
            if !node.conditions.iter().any(|c| &c.name == name) {
                result.error(
                    "V001",
                    &node.alias,
                    format!("edge source condition `{name}` is not declared"),
                );
            }
        }
        Endpoint::Artefact { .. } | Endpoint::ProducerPort { .. } => {
            result.error(
                "V001",
                &node.alias,
                "edge source must be an input, producer output, collector, or condition",
            );
        }
    }

    // Target endpoint existence and direction.
    match &edge.to {
        Endpoint::ProducerPort { producer, port } => match bp.child_by_name(scope, producer) {
            None => result.error(
                "V001",
                &node.alias,
                format!("edge target producer `{producer}` does not exist"),
            ),
            Some(child) => {
                if !child_inputs(bp, child).iter().any(|d| &d.name == port) {
                    result.error(
                        "V002",
                        &node.alias,
                        format!("producer `{producer}` declares no input port `{port}`"),
                    );
                }
            }
        },
        Endpoint::Artefact { name } => {
            if !node.artefacts.iter().any(|d| &d.name == name) {
                result.error(
                    "V001",
                    &node.alias,
                    format!("edge target artefact `{name}` is not declared"),
                );
            }
        }
        Endpoint::Collector { name } => {
            if !node.collectors.iter().any(|c| &c.name == name) {
                result.error(
                    "V001",
                    &node.alias,
                    format!("edge target collector `{name}` is not declared"),
                );
            }
        }
        Endpoint::Input { .. } | Endpoint::ProducerOutput { .. } | Endpoint::Condition { .. } => {
            result.error(
                "V001",
                &node.alias,
                "edge target must be a producer port, artefact, or collector",
            );
        }
    }

    // Condition guard.
    if let Some(condition) = &edge.condition {
        match node.conditions.iter().find(|c| &c.name == condition) {
            None => result.error(
                "V005",
                &node.alias,
                format!("edge names unknown condition `{condition}`"),
            ),
            Some(decl) => match node.inputs.iter().find(|d| d.name == decl.source) {
                None => result.error(
                    "V005",
                    &node.alias,
                    format!(
                        "condition `{condition}` reads undeclared input `{}`",
                        decl.source
                    ),
                ),
                Some(input) => {
                    if !input.ty.conforms_to(&PortType::Boolean) {
                        result.error(
                            "V005",
                            &node.alias,
                            format!("condition `{condition}` source is not boolean"),
                        );
                    }
                }
            },
        }
    }

    // Type conformance, where both ends are statically known. Collector
    // targets compare element-wise (the collector's type is its element
    // type; its output type is the list).
    if let (Some(src), Some(dst)) = (
        source_type(bp, scope, node, &edge.from),
        target_type(bp, scope, node, &edge.to),
    ) {
        if !src.conforms_to(&dst) {
            result.error(
                "V006",
                &node.alias,
                format!("connection type mismatch: {src:?} does not conform to {dst:?}"),
            );
        }
    }
}

fn check_collectors(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    result: &mut ValidationResult,
) {
    for collector in &node.collectors {
        let inbound: Vec<&Edge> = node
            .edges
            .iter()
            .filter(|e| matches!(&e.to, Endpoint::Collector { name } if name == &collector.name))
            .collect();
        if inbound.is_empty() {
            result.error(
                "V004",
                &node.alias,
                format!("collector `{}` has no inbound connections", collector.name),
            );
            continue;
        }
        let mut symbols = BTreeSet::new();
        for edge in inbound {
            match &edge.from {
                Endpoint::ProducerOutput { producer, .. } => {
                    match bp
                        .child_by_name(scope, producer)
                        .and_then(|c| bp.node(c).loop_spec.as_ref())
                    {
                        Some(loop_spec) => {
                            symbols.insert(loop_spec.symbol.clone());
                        }
                        None => result.error(
                            "V004",
                            &node.alias,
                            format!(
                                "collector `{}` input from `{producer}` is not loop-indexed",
                                collector.name
                            ),
                        ),
                    }
                }
                other => result.error(
                    "V004",
                    &node.alias,
                    format!(
                        "collector `{}` input must be a producer output, got {other:?}",
                        collector.name
                    ),
                ),
            }
        }
        if symbols.len() > 1 {
            result.error(
                "V004",
                &node.alias,
                format!(
                    "collector `{}` mixes loop symbols: {symbols:?}",
                    collector.name
                ),
            );
        }
    }
}

/// Per-scope sibling dependency graph, including hops through collectors.
fn sibling_graph(node: &ProducerNode) -> BTreeMap<String, BTreeSet<String>> {
    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    // Producer-to-collector and collector-to-producer hops.
    let mut collector_sources: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for edge in &node.edges {
        if let (Endpoint::ProducerOutput { producer, .. }, Endpoint::Collector { name }) =
            (&edge.from, &edge.to)
        {
            collector_sources
                .entry(name.as_str())
                .or_default()
                .insert(producer.clone());
        }
    }
    for edge in &node.edges {
        let targets = match &edge.to {
            Endpoint::ProducerPort { producer, .. } => vec![producer.clone()],
            _ => continue,
        };
        let sources: Vec<String> = match &edge.from {
            Endpoint::ProducerOutput { producer, .. } => vec![producer.clone()],
            Endpoint::Collector { name } => collector_sources
                .get(name.as_str())
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            _ => continue,
        };
        for source in sources {
            for target in &targets {
                graph.entry(source.clone()).or_default().insert(target.clone());
            }
        }
    }
    graph
}

fn check_cycles(node: &ProducerNode, result: &mut ValidationResult) {
    let graph = sibling_graph(node);
    let mut visiting = BTreeSet::new();
    let mut done = BTreeSet::new();

    fn dfs(
        current: &str,
        graph: &BTreeMap<String, BTreeSet<String>>,
        visiting: &mut BTreeSet<String>,
        done: &mut BTreeSet<String>,
    ) -> Option<String> {
        if done.contains(current) {
            return None;
        }
        if !visiting.insert(current.to_string()) {
            return Some(current.to_string());
        }
        if let Some(nexts) = graph.get(current) {
            for next in nexts {
                if let Some(cycle) = dfs(next, graph, visiting, done) {
                    return Some(cycle);
                }
            }
        }
        visiting.remove(current);
        done.insert(current.to_string());
        None
    }

    for start in graph.keys() {
        if let Some(at) = dfs(start, &graph, &mut visiting, &mut done) {
            result.error(
                "V007",
                &node.alias,
                format!("cycle through producers at `{at}`"),
            );
            return;
        }
    }
}

fn check_dimensions(
    bp: &Blueprint,
    scope: NodeId,
    node: &ProducerNode,
    result: &mut ValidationResult,
) {
    for edge in &node.edges {
        let (Endpoint::ProducerOutput { producer: from, .. }, Endpoint::ProducerPort { producer: to, .. }) =
            (&edge.from, &edge.to)
        else {
            continue;
        };
        let from_loop = bp
            .child_by_name(scope, from)
            .and_then(|c| bp.node(c).loop_spec.clone());
        let to_loop = bp
            .child_by_name(scope, to)
            .and_then(|c| bp.node(c).loop_spec.clone());
        match (from_loop, to_loop) {
            (Some(a), Some(b)) => {
                if a.count != b.count {
                    result.error(
                        "V008",
                        &node.alias,
                        format!(
                            "`{from}` and `{to}` loop over different cardinality sources"
                        ),
                    );
                }
            }
            (Some(_), None) => {
                result.error(
                    "V008",
                    &node.alias,
                    format!(
                        "indexed output of `{from}` feeds scalar `{to}` without a collector"
                    ),
                );
            }
            _ => {}
        }
    }
}

fn check_unused(bp: &Blueprint, node: &ProducerNode, result: &mut ValidationResult) {
    // Inputs never read by an edge, condition, or loop count.
    for input in &node.inputs {
        if node.is_leaf_producer() {
            // Leaf producer inputs are bound by the planner directly.
            continue;
        }
        let read_by_edge = node
            .edges
            .iter()
            .any(|e| matches!(&e.from, Endpoint::Input { key } if key == &input.name));
        let read_by_condition = node.conditions.iter().any(|c| c.source == input.name);
        let read_by_count = bp.nodes().any(|(_, n)| {
            matches!(
                &n.loop_spec,
                Some(ls) if matches!(
                    &ls.count,
                    CountSource::Input(id) if id.ends_with(&format!(".{}", input.name))
                        || id == &format!("Input:{}", input.name)
                )
            )
        });
        if !read_by_edge && !read_by_condition && !read_by_count {
            result.warn(
                "W001",
                &node.alias,
                format!("input `{}` is never used", input.name),
            );
        }
    }

    // Artefacts nothing produces.
    for artefact in &node.artefacts {
        if node.is_leaf_producer() {
            continue;
        }
        let produced = node
            .edges
            .iter()
            .any(|e| matches!(&e.to, Endpoint::Artefact { name } if name == &artefact.name));
        if !produced {
            result.warn(
                "W002",
                &node.alias,
                format!("artefact `{}` is never produced", artefact.name),
            );
        }
    }

    // Leaf producers whose outputs feed nothing.
    for &child_id in &node.producers {
        let child = bp.node(child_id);
        if !child.is_leaf_producer() {
            continue;
        }
        let name = &child.meta.name;
        let consumed = node.edges.iter().any(|e| {
            matches!(&e.from, Endpoint::ProducerOutput { producer, .. } if producer == name)
        });
        if !consumed {
            result.warn(
                "W003",
                &node.alias,
                format!("producer `{name}` output feeds nothing"),
            );
        }
    }
}
