//! Job graph types and the workflow template builder.
//!
//! A ComfyUI job graph ("prompt") is a JSON object keyed by node id. Each
//! node carries a `class_type` and a map of `inputs`, where an input is
//! either a literal value or a `[node_id, output_slot]` link to another
//! node. The graph is opaque payload to this crate: apart from the two
//! image-loader inputs rewritten by [`WorkflowTemplate::build`], every
//! node and field is forwarded exactly as loaded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Built-in face swap workflow (ReActor), embedded at compile time.
pub const FACE_SWAP_WORKFLOW: &str = include_str!("../workflows/face_swap.json");

/// Loader node for the image whose face gets replaced.
pub const DEFAULT_INPUT_NODE: &str = "3";

/// Loader node for the image that provides the replacement face.
pub const DEFAULT_SOURCE_NODE: &str = "4";

/// Input field of a `LoadImage` node holding the server-side filename.
const IMAGE_INPUT: &str = "image";

/// A complete job graph, keyed by node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph(BTreeMap<String, NodeSpec>);

/// One node of a [`JobGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, NodeInput>,
    /// Fields this crate does not interpret (e.g. `_meta`), kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A node input: a link to another node's output, or a literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeInput {
    Link(NodeLink),
    Literal(serde_json::Value),
}

/// Reference to output slot `.1` of node `.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLink(pub String, pub u32);

impl JobGraph {
    pub fn new(nodes: BTreeMap<String, NodeSpec>) -> Self {
        Self(nodes)
    }

    /// Parse a graph from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("invalid workflow JSON: {e}")))
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.0.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeSpec)> {
        self.0.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn set_literal(&mut self, node_id: &str, input: &str, value: &str) {
        if let Some(node) = self.0.get_mut(node_id) {
            node.inputs.insert(
                input.to_string(),
                NodeInput::Literal(serde_json::Value::String(value.to_string())),
            );
        }
    }
}

/// An immutable job graph plus the two loader nodes that receive the
/// uploaded images.
///
/// [`build`](Self::build) clones the template for every job, so a
/// long-lived process can reuse one template without fields from one
/// job bleeding into the next.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: JobGraph,
    input_node: String,
    source_node: String,
}

impl WorkflowTemplate {
    /// Wrap a graph, checking that both loader nodes exist and carry an
    /// `image` input.
    pub fn new(
        graph: JobGraph,
        input_node: impl Into<String>,
        source_node: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let input_node = input_node.into();
        let source_node = source_node.into();

        if input_node == source_node {
            return Err(CoreError::Validation(format!(
                "input and source loader must be different nodes (both are {input_node})"
            )));
        }
        for id in [&input_node, &source_node] {
            let node = graph.node(id).ok_or_else(|| {
                CoreError::Validation(format!("workflow has no node {id}"))
            })?;
            if !node.inputs.contains_key(IMAGE_INPUT) {
                return Err(CoreError::Validation(format!(
                    "node {id} ({}) has no `{IMAGE_INPUT}` input",
                    node.class_type
                )));
            }
        }

        Ok(Self {
            graph,
            input_node,
            source_node,
        })
    }

    /// Parse a template from JSON text.
    pub fn from_json(json: &str, input_node: &str, source_node: &str) -> Result<Self, CoreError> {
        Self::new(JobGraph::from_json(json)?, input_node, source_node)
    }

    /// The embedded ReActor face swap template.
    pub fn face_swap() -> Result<Self, CoreError> {
        Self::from_json(FACE_SWAP_WORKFLOW, DEFAULT_INPUT_NODE, DEFAULT_SOURCE_NODE)
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn input_node(&self) -> &str {
        &self.input_node
    }

    pub fn source_node(&self) -> &str {
        &self.source_node
    }

    /// Produce a fresh graph for one job with the loader nodes pointing at
    /// the uploaded server-side filenames.
    pub fn build(&self, input_image: &str, source_image: &str) -> JobGraph {
        let mut graph = self.graph.clone();
        graph.set_literal(&self.input_node, IMAGE_INPUT, input_image);
        graph.set_literal(&self.source_node, IMAGE_INPUT, source_image);
        graph
    }
}
