// Flow builder
//
// A type-safe way to generate ComfyUI node graphs. Nodes are added in call
// order; edges are references to an upstream node's output slot, which
// serialize as ["<node id>", <slot>] in the API-format prompt JSON.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::registry::NodeRegistry;

/// Handle to a node in a Flow. Only meaningful for the flow that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    id: u32,
}

impl NodeRef {
    /// A reference to one of this node's output slots, usable as an input to
    /// a downstream node.
    pub fn output(self, slot: u32) -> Input {
        Input::Slot(self.id, slot)
    }

    pub fn id(self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Text(String),
    Int(i64),
    /// Seeds span the full u64 range, which Int can't hold.
    Uint(u64),
    Float(f64),
    Bool(bool),
    /// An upstream node's output: (node id, slot index).
    Slot(u32, u32),
}

impl Input {
    pub fn text(value: &str) -> Input {
        Input::Text(value.to_string())
    }

    fn to_json(&self) -> Value {
        match self {
            Input::Text(s) => json!(s),
            Input::Int(n) => json!(n),
            Input::Uint(n) => json!(n),
            Input::Float(n) => json!(n),
            Input::Bool(b) => json!(b),
            Input::Slot(node, slot) => json!([node.to_string(), slot]),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    class_type: String,
    inputs: Vec<(String, Input)>,
}

/// A node graph under construction. Cloning is cheap enough and gives us the
/// reusable-prefix pattern: build the model-loading subgraph once, clone it
/// per render and append the per-prompt stages.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    next_id: u32,
    nodes: BTreeMap<u32, Node>,
}

impl Flow {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            nodes: BTreeMap::new(),
        }
    }

    /// Adds a node and returns a handle to it.
    pub fn add(&mut self, class_type: &str, inputs: Vec<(&str, Input)>) -> NodeRef {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                class_type: class_type.to_string(),
                inputs: inputs
                    .into_iter()
                    .map(|(name, input)| (name.to_string(), input))
                    .collect(),
            },
        );
        NodeRef { id }
    }

    /// Checks every node's class against the backend registry.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<()> {
        for node in self.nodes.values() {
            registry.class(&node.class_type)?;
        }
        Ok(())
    }

    /// Renders the graph in the format POST /prompt accepts.
    pub fn to_prompt(&self) -> Value {
        let mut prompt = Map::new();
        for (id, node) in &self.nodes {
            let mut inputs = Map::new();
            for (name, input) in &node.inputs {
                inputs.insert(name.clone(), input.to_json());
            }
            prompt.insert(
                id.to_string(),
                json!({
                    "class_type": node.class_type,
                    "inputs": inputs,
                }),
            );
        }
        Value::Object(prompt)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
