// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory blueprint tree.
//!
//! A blueprint is a typed dataflow graph: producer nodes consume inputs and
//! emit artefacts, wired together by edges. Nodes live in an arena indexed
//! by [`NodeId`]; all cross-node references, including the child-to-parent
//! backlink, are indices rather than owning pointers.
//!
//! Parsing (YAML/TOML) is out of scope; callers assemble the tree through
//! [`Blueprint::add_producer`] and friends, then hand it to the validator
//! and planner. The tree is read-only once loaded.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod validator;

pub use validator::{validate, ValidationIssue, ValidationResult};

use rf_id::format_producer_alias;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arena index of a blueprint node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Identity metadata carried by every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Stable node id from the authoring surface.
    pub id: String,
    /// Human-readable name (the local alias segment).
    pub name: String,
    /// Prompt file the authoring surface associated with the node.
    pub prompt_file: Option<String>,
    /// Authoring-surface version tag.
    pub version: Option<String>,
}

/// Value type of a port, input, or artefact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    /// UTF-8 text.
    Text,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// Arbitrary JSON.
    Json,
    /// Image bytes.
    Image,
    /// Audio bytes.
    Audio,
    /// Video bytes.
    Video,
    /// Matches any type.
    Any,
    /// Homogeneous list of a type.
    List(Box<PortType>),
}

impl PortType {
    /// Whether a value of this type can feed a port of `target` type.
    pub fn conforms_to(&self, target: &PortType) -> bool {
        match (self, target) {
            (_, PortType::Any) | (PortType::Any, _) => true,
            (PortType::List(a), PortType::List(b)) => a.conforms_to(b),
            (a, b) => a == b,
        }
    }
}

/// A declared input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    /// Local port name.
    pub name: String,
    /// Port type.
    pub ty: PortType,
}

impl InputDecl {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, ty: PortType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A declared artefact (output) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtefactDecl {
    /// Local artefact name.
    pub name: String,
    /// Artefact type.
    pub ty: PortType,
}

impl ArtefactDecl {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, ty: PortType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Where a loop dimension's cardinality comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    /// A fixed count known at authoring time.
    Const(u64),
    /// A canonical `Input:` id holding the count at planning time.
    Input(String),
}

/// Loop dimension of a producer whose outputs are indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Loop symbol referenced by `[sym]` selectors. Indices are zero-based.
    pub symbol: String,
    /// Cardinality source.
    pub count: CountSource,
}

/// An external producer specification referenced by nodes.
///
/// Imports carry the provider coordinates and the allowed port schema;
/// a node referencing an import may not invent ports outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerImport {
    /// Import name referenced by [`ProducerSpec::import_ref`].
    pub name: String,
    /// Provider the handler registry resolves against.
    pub provider: String,
    /// Provider model identifier.
    pub provider_model: String,
    /// Allowed input ports.
    pub inputs: Vec<InputDecl>,
    /// Allowed output slots.
    pub outputs: Vec<ArtefactDecl>,
    /// Provider options passed through to handlers.
    pub provider_options: serde_json::Value,
}

/// One endpoint of an edge, scoped to the node declaring the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The scope's own declared input.
    Input {
        /// Declared input name.
        key: String,
    },
    /// The scope's own declared artefact.
    Artefact {
        /// Declared artefact name.
        name: String,
    },
    /// An input port of a child producer.
    ProducerPort {
        /// Child producer's local name.
        producer: String,
        /// Port name.
        port: String,
    },
    /// An output of a child producer.
    ProducerOutput {
        /// Child producer's local name.
        producer: String,
        /// Output name.
        output: String,
    },
    /// A collector node declared in this scope.
    Collector {
        /// Collector name.
        name: String,
    },
    /// A condition node declared in this scope.
    Condition {
        /// Condition name.
        name: String,
    },
}

/// A directed connection between two endpoints in one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source endpoint.
    pub from: Endpoint,
    /// Target endpoint.
    pub to: Endpoint,
    /// Name of a condition guarding this edge, if any.
    pub condition: Option<String>,
}

impl Edge {
    /// Unconditional edge.
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self {
            from,
            to,
            condition: None,
        }
    }

    /// Edge taken only when the named condition holds.
    pub fn when(from: Endpoint, to: Endpoint, condition: impl Into<String>) -> Self {
        Self {
            from,
            to,
            condition: Some(condition.into()),
        }
    }
}

/// A collector aggregates every loop index of a producer output into one
/// list-valued artefact at the enclosing level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorDecl {
    /// Collector name; its output artefact id is `Artifact:<scope>.<name>`.
    pub name: String,
    /// Element type collected.
    pub ty: PortType,
}

/// A condition gates edges on a boolean input of the declaring scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDecl {
    /// Condition name referenced by [`Edge::condition`].
    pub name: String,
    /// Local input key whose boolean value decides the condition.
    pub source: String,
}

/// Everything needed to add a producer node to the tree.
#[derive(Debug, Clone, Default)]
pub struct ProducerSpec {
    /// Local name (becomes the next alias segment).
    pub name: String,
    /// Node metadata; `meta.name` is filled from `name` when empty.
    pub meta: NodeMeta,
    /// Import this node instantiates, if any.
    pub import_ref: Option<String>,
    /// Inline provider (ignored when `import_ref` is set).
    pub provider: Option<String>,
    /// Inline provider model (ignored when `import_ref` is set).
    pub provider_model: Option<String>,
    /// Inline declared input ports.
    pub inputs: Vec<InputDecl>,
    /// Inline declared artefacts.
    pub artefacts: Vec<ArtefactDecl>,
    /// Loop dimension, when outputs are indexed.
    pub loop_spec: Option<LoopSpec>,
    /// Provider options passed through to handlers.
    pub provider_options: serde_json::Value,
    /// Rate-limit bucket; defaults to the provider name.
    pub rate_key: Option<String>,
}

impl ProducerSpec {
    /// Start a spec with just a local name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A node in the blueprint arena.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerNode {
    /// Identity metadata.
    pub meta: NodeMeta,
    /// Dotted alias; empty for the root.
    pub alias: String,
    /// Parent node, by index. `None` only for the root.
    pub parent: Option<NodeId>,
    /// Import reference, if this node instantiates one.
    pub import_ref: Option<String>,
    /// Inline provider.
    pub provider: Option<String>,
    /// Inline provider model.
    pub provider_model: Option<String>,
    /// Declared input ports (inline; imports add theirs on top).
    pub inputs: Vec<InputDecl>,
    /// Declared artefacts.
    pub artefacts: Vec<ArtefactDecl>,
    /// Child producers, by index.
    pub producers: Vec<NodeId>,
    /// Edges declared in this node's scope.
    pub edges: Vec<Edge>,
    /// Collectors declared in this scope.
    pub collectors: Vec<CollectorDecl>,
    /// Conditions declared in this scope.
    pub conditions: Vec<ConditionDecl>,
    /// Loop dimension.
    pub loop_spec: Option<LoopSpec>,
    /// Provider options.
    pub provider_options: serde_json::Value,
    /// Rate-limit bucket.
    pub rate_key: Option<String>,
}

impl ProducerNode {
    /// `true` when the node invokes a provider (directly or via import).
    pub fn is_leaf_producer(&self) -> bool {
        self.import_ref.is_some() || self.provider.is_some()
    }
}

/// The effective provider coordinates and schema of a leaf producer after
/// import resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveProducer<'a> {
    /// Provider name.
    pub provider: &'a str,
    /// Provider model.
    pub provider_model: &'a str,
    /// Allowed input ports.
    pub inputs: Vec<&'a InputDecl>,
    /// Allowed outputs.
    pub outputs: Vec<&'a ArtefactDecl>,
    /// Provider options.
    pub provider_options: &'a serde_json::Value,
    /// Rate-limit bucket.
    pub rate_key: String,
}

/// The blueprint tree: an arena of nodes plus the import table.
#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    nodes: Vec<ProducerNode>,
    imports: BTreeMap<String, ProducerImport>,
    root: NodeId,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Blueprint {
    /// Create a blueprint holding only the root scope.
    pub fn new() -> Self {
        let root = ProducerNode {
            meta: NodeMeta {
                id: "root".into(),
                name: String::new(),
                prompt_file: None,
                version: None,
            },
            alias: String::new(),
            parent: None,
            import_ref: None,
            provider: None,
            provider_model: None,
            inputs: Vec::new(),
            artefacts: Vec::new(),
            producers: Vec::new(),
            edges: Vec::new(),
            collectors: Vec::new(),
            conditions: Vec::new(),
            loop_spec: None,
            provider_options: serde_json::Value::Null,
            rate_key: None,
        };
        Self {
            nodes: vec![root],
            imports: BTreeMap::new(),
            root: NodeId(0),
        }
    }

    /// The root scope.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Register a producer import, replacing any previous one of the name.
    pub fn add_import(&mut self, import: ProducerImport) {
        self.imports.insert(import.name.clone(), import);
    }

    /// Look up an import by name.
    pub fn import(&self, name: &str) -> Option<&ProducerImport> {
        self.imports.get(name)
    }

    /// Add a producer under `parent`, returning its arena index.
    pub fn add_producer(&mut self, parent: NodeId, spec: ProducerSpec) -> NodeId {
        let parent_alias = self.nodes[parent.0].alias.clone();
        let alias = format_producer_alias(&parent_alias, &spec.name);
        let mut meta = spec.meta;
        if meta.name.is_empty() {
            meta.name = spec.name.clone();
        }
        if meta.id.is_empty() {
            meta.id = alias.clone();
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(ProducerNode {
            meta,
            alias,
            parent: Some(parent),
            import_ref: spec.import_ref,
            provider: spec.provider,
            provider_model: spec.provider_model,
            inputs: spec.inputs,
            artefacts: spec.artefacts,
            producers: Vec::new(),
            edges: Vec::new(),
            collectors: Vec::new(),
            conditions: Vec::new(),
            loop_spec: spec.loop_spec,
            provider_options: spec.provider_options,
            rate_key: spec.rate_key,
        });
        self.nodes[parent.0].producers.push(id);
        id
    }

    /// Declare an input on a node.
    pub fn add_input(&mut self, node: NodeId, decl: InputDecl) {
        self.nodes[node.0].inputs.push(decl);
    }

    /// Declare an artefact on a node.
    pub fn add_artefact(&mut self, node: NodeId, decl: ArtefactDecl) {
        self.nodes[node.0].artefacts.push(decl);
    }

    /// Add an edge to a node's scope.
    pub fn add_edge(&mut self, node: NodeId, edge: Edge) {
        self.nodes[node.0].edges.push(edge);
    }

    /// Declare a collector in a node's scope.
    pub fn add_collector(&mut self, node: NodeId, decl: CollectorDecl) {
        self.nodes[node.0].collectors.push(decl);
    }

    /// Declare a condition in a node's scope.
    pub fn add_condition(&mut self, node: NodeId, decl: ConditionDecl) {
        self.nodes[node.0].conditions.push(decl);
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &ProducerNode {
        &self.nodes[id.0]
    }

    /// Iterate all nodes with their indices.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ProducerNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Iterate leaf producers (nodes that invoke a provider).
    pub fn leaf_producers(&self) -> impl Iterator<Item = (NodeId, &ProducerNode)> {
        self.nodes().filter(|(_, n)| n.is_leaf_producer())
    }

    /// Find a node by its dotted alias.
    pub fn find_by_alias(&self, alias: &str) -> Option<NodeId> {
        self.nodes()
            .find(|(_, n)| n.alias == alias)
            .map(|(id, _)| id)
    }

    /// Find a child of `scope` by local name.
    pub fn child_by_name(&self, scope: NodeId, name: &str) -> Option<NodeId> {
        self.node(scope)
            .producers
            .iter()
            .copied()
            .find(|&c| self.node(c).meta.name == name)
    }

    /// Resolve a leaf producer's effective provider coordinates and schema.
    ///
    /// Returns `None` for namespace nodes, or when an `import_ref` dangles
    /// (the validator reports that case).
    pub fn effective(&self, id: NodeId) -> Option<EffectiveProducer<'_>> {
        let node = self.node(id);
        if let Some(import_name) = &node.import_ref {
            let import = self.imports.get(import_name)?;
            let mut inputs: Vec<&InputDecl> = import.inputs.iter().collect();
            inputs.extend(node.inputs.iter());
            let mut outputs: Vec<&ArtefactDecl> = import.outputs.iter().collect();
            outputs.extend(node.artefacts.iter());
            return Some(EffectiveProducer {
                provider: &import.provider,
                provider_model: &import.provider_model,
                inputs,
                outputs,
                provider_options: if node.provider_options.is_null() {
                    &import.provider_options
                } else {
                    &node.provider_options
                },
                rate_key: node
                    .rate_key
                    .clone()
                    .unwrap_or_else(|| import.provider.clone()),
            });
        }
        let provider = node.provider.as_deref()?;
        Some(EffectiveProducer {
            provider,
            provider_model: node.provider_model.as_deref().unwrap_or_default(),
            inputs: node.inputs.iter().collect(),
            outputs: node.artefacts.iter().collect(),
            provider_options: &node.provider_options,
            rate_key: node.rate_key.clone().unwrap_or_else(|| provider.to_string()),
        })
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` when only the root scope exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_dotted_paths() {
        let mut bp = Blueprint::new();
        let ns = bp.add_producer(bp.root(), ProducerSpec::named("Act1"));
        let shots = bp.add_producer(ns, ProducerSpec::named("Shots"));
        assert_eq!(bp.node(ns).alias, "Act1");
        assert_eq!(bp.node(shots).alias, "Act1.Shots");
        assert_eq!(bp.node(shots).parent, Some(ns));
        assert_eq!(bp.find_by_alias("Act1.Shots"), Some(shots));
        assert_eq!(bp.child_by_name(ns, "Shots"), Some(shots));
    }

    #[test]
    fn effective_resolves_imports() {
        let mut bp = Blueprint::new();
        bp.add_import(ProducerImport {
            name: "tts".into(),
            provider: "eleven".into(),
            provider_model: "v3".into(),
            inputs: vec![InputDecl::new("text", PortType::Text)],
            outputs: vec![ArtefactDecl::new("speech", PortType::Audio)],
            provider_options: serde_json::json!({"voice": "sage"}),
        });
        let p = bp.add_producer(
            bp.root(),
            ProducerSpec {
                import_ref: Some("tts".into()),
                ..ProducerSpec::named("Narration")
            },
        );
        let eff = bp.effective(p).unwrap();
        assert_eq!(eff.provider, "eleven");
        assert_eq!(eff.provider_model, "v3");
        assert_eq!(eff.inputs.len(), 1);
        assert_eq!(eff.outputs.len(), 1);
        assert_eq!(eff.rate_key, "eleven");
        assert_eq!(eff.provider_options["voice"], "sage");
    }

    #[test]
    fn namespace_nodes_have_no_effective_producer() {
        let mut bp = Blueprint::new();
        let ns = bp.add_producer(bp.root(), ProducerSpec::named("Act1"));
        assert!(bp.effective(ns).is_none());
        assert!(!bp.node(ns).is_leaf_producer());
    }

    #[test]
    fn type_conformance() {
        assert!(PortType::Text.conforms_to(&PortType::Text));
        assert!(PortType::Text.conforms_to(&PortType::Any));
        assert!(PortType::Any.conforms_to(&PortType::Video));
        assert!(!PortType::Text.conforms_to(&PortType::Audio));
        assert!(PortType::List(Box::new(PortType::Image))
            .conforms_to(&PortType::List(Box::new(PortType::Any))));
        assert!(!PortType::List(Box::new(PortType::Image))
            .conforms_to(&PortType::List(Box::new(PortType::Audio))));
    }

    #[test]
    fn empty_blueprint_has_only_root() {
        let bp = Blueprint::new();
        assert!(bp.is_empty());
        assert_eq!(bp.len(), 1);
        assert_eq!(bp.leaf_producers().count(), 0);
    }
}
