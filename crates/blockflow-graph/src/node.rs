use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::types::STDIN_PORT;

/// A declared node: either bound to a function or owning a subgraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique within its graph; dot-qualified once flattened.
    pub key: String,
    /// Function key, resolved through the registry.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    /// Input port -> upstream reference (`node` or `node:output`).
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Cron expression hinting when the node should run.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Nested subgraph.
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    /// Child receiving the subgraph's `stdin` input.
    #[serde(default)]
    pub stdin_key: Option<String>,
    /// Child whose output is the subgraph's output.
    #[serde(default)]
    pub stdout_key: Option<String>,
}

impl NodeDef {
    /// Create a node bound to `function`.
    pub fn new(key: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            function: Some(function.into()),
            params: serde_json::Map::new(),
            inputs: BTreeMap::new(),
            schedule: None,
            nodes: vec![],
            stdin_key: None,
            stdout_key: None,
        }
    }

    /// Create a node that owns a nested subgraph.
    pub fn subgraph(key: impl Into<String>, nodes: Vec<NodeDef>) -> Self {
        Self {
            key: key.into(),
            function: None,
            params: serde_json::Map::new(),
            inputs: BTreeMap::new(),
            schedule: None,
            nodes,
            stdin_key: None,
            stdout_key: None,
        }
    }

    /// Connect `port` to `upstream`.
    pub fn with_input(mut self, port: &str, upstream: &str) -> Self {
        self.inputs.insert(port.to_string(), upstream.to_string());
        self
    }

    /// Connect the node's single default input to `upstream`.
    pub fn with_upstream(self, upstream: &str) -> Self {
        self.with_input(STDIN_PORT, upstream)
    }

    pub fn with_param(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn with_schedule(mut self, cron: &str) -> Self {
        self.schedule = Some(cron.to_string());
        self
    }

    pub fn with_stdin(mut self, child: &str) -> Self {
        self.stdin_key = Some(child.to_string());
        self
    }

    pub fn with_stdout(mut self, child: &str) -> Self {
        self.stdout_key = Some(child.to_string());
        self
    }

    pub fn is_subgraph(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// A declared graph of (possibly nested) nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    pub fn new(nodes: Vec<NodeDef>) -> Result<Self> {
        let mut graph = Self::default();
        for node in nodes {
            graph.add_node(node)?;
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, node: NodeDef) -> Result<()> {
        if self.has_node(&node.key) {
            return Err(BlockflowError::Graph(format!("Duplicate node key {}", node.key)));
        }
        check_unique_children(&node)?;
        self.nodes.push(node);
        Ok(())
    }

    pub fn has_node(&self, key: &str) -> bool {
        self.nodes.iter().any(|n| n.key == key)
    }

    pub fn node(&self, key: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn is_flat(&self) -> bool {
        self.nodes.iter().all(|n| !n.is_subgraph())
    }
}

fn check_unique_children(node: &NodeDef) -> Result<()> {
    let mut seen = HashSet::new();
    for child in &node.nodes {
        if !seen.insert(child.key.as_str()) {
            return Err(BlockflowError::Graph(format!(
                "Duplicate node key {} in subgraph {}",
                child.key, node.key
            )));
        }
        check_unique_children(child)?;
    }
    Ok(())
}

/// A parsed upstream reference: `node` or `node:output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamRef {
    pub node: String,
    pub output: Option<String>,
}

impl UpstreamRef {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((node, output)) => Self {
                node: node.to_string(),
                output: Some(output.to_string()),
            },
            None => Self {
                node: s.to_string(),
                output: None,
            },
        }
    }

    pub fn with_node(&self, node: String) -> Self {
        Self {
            node,
            output: self.output.clone(),
        }
    }
}

impl fmt::Display for UpstreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.output {
            Some(output) => write!(f, "{}:{}", self.node, output),
            None => f.write_str(&self.node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_keys_rejected() {
        let err = GraphDef::new(vec![NodeDef::new("a", "core.passthrough"), NodeDef::new("a", "x")])
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate node key a"));

        let sub = NodeDef::subgraph(
            "s",
            vec![NodeDef::new("c", "f"), NodeDef::new("c", "f")],
        );
        assert!(GraphDef::new(vec![sub]).is_err());
    }

    #[test]
    fn test_upstream_ref_parse() {
        let r = UpstreamRef::parse("sub.child:errors");
        assert_eq!(r.node, "sub.child");
        assert_eq!(r.output.as_deref(), Some("errors"));
        assert_eq!(r.to_string(), "sub.child:errors");
        assert_eq!(UpstreamRef::parse("src").output, None);
    }

    #[test]
    fn test_graph_from_json() {
        let g: GraphDef = serde_json::from_str(
            r#"{"nodes": [{"key": "src", "function": "core.import_records",
                           "params": {"records": []}},
                          {"key": "acc", "function": "core.accumulator",
                           "inputs": {"input": "src"}}]}"#,
        )
        .unwrap();
        assert!(g.is_flat());
        assert_eq!(g.node("acc").unwrap().inputs["input"], "src");
    }
}
