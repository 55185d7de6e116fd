use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::types::{DEFAULT_OUTPUT_NAME, STDIN_PORT};
use blockflow_functions::interface::InputKind;
use blockflow_functions::{ComponentRegistry, FunctionDef};

use crate::flatten::flatten;
use crate::node::{GraphDef, NodeDef, UpstreamRef};
use crate::schedule::ScheduleHint;

/// A resolved connection from an upstream output to a node input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from_node: String,
    pub from_output: String,
    pub to_node: String,
    pub to_input: String,
    pub kind: InputKind,
}

impl Edge {
    pub fn is_self_reference(&self) -> bool {
        self.from_node == self.to_node
    }
}

/// A node of a flattened, resolved graph.
#[derive(Debug, Clone)]
pub struct FlatNode {
    pub key: String,
    pub function: Arc<FunctionDef>,
    /// Parameters declared on the node, before function defaults.
    pub params: serde_json::Map<String, Value>,
    /// One edge per connected input.
    pub inputs: Vec<Edge>,
    pub schedule: Option<ScheduleHint>,
    /// Position in declaration order.
    pub index: usize,
}

impl FlatNode {
    pub fn input_edge(&self, input: &str) -> Option<&Edge> {
        self.inputs.iter().find(|e| e.to_input == input)
    }

    pub fn function_key(&self) -> String {
        self.function.key()
    }
}

/// A flat graph with resolved edges and a deterministic execution order.
#[derive(Debug, Clone)]
pub struct FlatGraph {
    nodes: Vec<FlatNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

/// Flatten `graph` and resolve every node against `registry`.
pub fn build(graph: &GraphDef, registry: &ComponentRegistry) -> Result<FlatGraph> {
    let flat = flatten(graph)?;

    let index: HashMap<String, usize> = flat
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.key.clone(), i))
        .collect();

    let mut functions = Vec::with_capacity(flat.nodes.len());
    for node in &flat.nodes {
        let key = node.function.as_deref().ok_or_else(|| {
            BlockflowError::Graph(format!("node {} has neither a function nor nodes", node.key))
        })?;
        functions.push(registry.resolve_function(key)?);
    }

    let mut nodes = Vec::with_capacity(flat.nodes.len());
    for (i, node) in flat.nodes.iter().enumerate() {
        let function = functions[i].clone();
        check_params(node, &function)?;
        let inputs = resolve_inputs(node, &function, &flat.nodes, &index, &functions)?;
        let schedule = node.schedule.as_deref().map(ScheduleHint::parse).transpose()?;
        nodes.push(FlatNode {
            key: node.key.clone(),
            function,
            params: node.params.clone(),
            inputs,
            schedule,
            index: i,
        });
    }

    let order = topological_order(&nodes)?;
    debug!(nodes = nodes.len(), "Built flat graph");
    Ok(FlatGraph {
        nodes,
        index,
        order,
    })
}

fn check_params(node: &NodeDef, function: &FunctionDef) -> Result<()> {
    for p in &function.interface.parameters {
        match node.params.get(&p.name).filter(|v| !v.is_null()) {
            Some(value) if !p.param_type.accepts(value) => {
                return Err(BlockflowError::Graph(format!(
                    "parameter {} of node {} expects {:?}, got {}",
                    p.name, node.key, p.param_type, value
                )))
            }
            None if p.required => {
                return Err(BlockflowError::Graph(format!(
                    "node {} is missing required parameter {}",
                    node.key, p.name
                )))
            }
            _ => {}
        }
    }
    for name in node.params.keys() {
        if function.interface.parameter(name).is_none() {
            warn!(node = %node.key, param = %name, "Parameter not declared by function");
        }
    }
    Ok(())
}

fn resolve_inputs(
    node: &NodeDef,
    function: &FunctionDef,
    all: &[NodeDef],
    index: &HashMap<String, usize>,
    functions: &[Arc<FunctionDef>],
) -> Result<Vec<Edge>> {
    let interface = &function.interface;
    let mut edges = Vec::new();

    for (port, upstream) in &node.inputs {
        let input = if port == STDIN_PORT {
            interface.default_input().ok_or_else(|| {
                BlockflowError::Graph(format!(
                    "node {} has no single default input for stdin",
                    node.key
                ))
            })?
        } else {
            interface.input(port).ok_or_else(|| {
                BlockflowError::Graph(format!("node {} has no input named {}", node.key, port))
            })?
        };
        if input.kind == InputKind::SelfReference {
            continue;
        }
        let r = UpstreamRef::parse(upstream);
        let upstream_idx = *index
            .get(&r.node)
            .ok_or_else(|| BlockflowError::not_found("Node", &r.node))?;
        let from_output = r.output.clone().unwrap_or_else(|| {
            functions[upstream_idx]
                .interface
                .default_output()
                .map(|o| o.name.clone())
                .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string())
        });
        if edges.iter().any(|e: &Edge| e.to_input == input.name) {
            return Err(BlockflowError::Graph(format!(
                "input {} of node {} is connected twice",
                input.name, node.key
            )));
        }
        edges.push(Edge {
            from_node: all[upstream_idx].key.clone(),
            from_output,
            to_node: node.key.clone(),
            to_input: input.name.clone(),
            kind: input.kind,
        });
    }

    for input in &interface.inputs {
        if input.kind == InputKind::SelfReference {
            edges.push(Edge {
                from_node: node.key.clone(),
                from_output: interface
                    .default_output()
                    .map(|o| o.name.clone())
                    .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string()),
                to_node: node.key.clone(),
                to_input: input.name.clone(),
                kind: input.kind,
            });
        } else if input.required && !edges.iter().any(|e| e.to_input == input.name) {
            return Err(BlockflowError::MissingInput {
                node: node.key.clone(),
                input: input.name.clone(),
            });
        }
    }
    Ok(edges)
}

/// Kahn's algorithm; ready nodes are taken in declaration order.
/// Self-references are not dependencies.
fn topological_order(nodes: &[FlatNode]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.key.as_str(), i))
        .collect();

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let preds: HashSet<usize> = node
            .inputs
            .iter()
            .filter(|e| !e.is_self_reference())
            .filter_map(|e| index.get(e.from_node.as_str()).copied())
            .collect();
        for p in preds {
            successors[p].insert(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &s in &successors[i] {
            in_degree[s] -= 1;
            if in_degree[s] == 0 {
                ready.insert(s);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| nodes[i].key.as_str())
            .collect();
        return Err(BlockflowError::GraphCycle(stuck.join(", ")));
    }
    Ok(order)
}

impl FlatGraph {
    pub fn node(&self, key: &str) -> Result<&FlatNode> {
        self.index
            .get(key)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| BlockflowError::not_found("Node", key))
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn execution_order(&self) -> Vec<&FlatNode> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes.iter().flat_map(|n| n.inputs.iter())
    }

    /// Every transitive predecessor of `key`, in execution order, without
    /// `key` itself.
    pub fn upstream_dependencies(&self, key: &str) -> Result<Vec<&FlatNode>> {
        let start = self.node(key)?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&FlatNode> = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for edge in node.inputs.iter().filter(|e| !e.is_self_reference()) {
                if seen.insert(edge.from_node.as_str()) {
                    queue.push_back(self.node(&edge.from_node)?);
                }
            }
        }
        Ok(self
            .execution_order()
            .into_iter()
            .filter(|n| seen.contains(n.key.as_str()) && n.key != key)
            .collect())
    }

    /// Groups of nodes whose dependencies all lie in earlier groups.
    pub fn dependency_levels(&self) -> Vec<Vec<&FlatNode>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&FlatNode>> = Vec::new();
        for node in self.execution_order() {
            let l = node
                .inputs
                .iter()
                .filter(|e| !e.is_self_reference())
                .filter_map(|e| level.get(e.from_node.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(node.key.as_str(), l);
            if levels.len() <= l {
                levels.resize_with(l + 1, Vec::new);
            }
            levels[l].push(node);
        }
        levels
    }

    /// Adjacency list in declaration order: node -> sorted downstream keys.
    pub fn adjacency(&self) -> Vec<(String, Vec<String>)> {
        self.nodes
            .iter()
            .map(|n| {
                let mut downstream: Vec<String> = self
                    .edges()
                    .filter(|e| e.from_node == n.key && !e.is_self_reference())
                    .map(|e| e.to_node.clone())
                    .collect();
                downstream.sort();
                downstream.dedup();
                (n.key.clone(), downstream)
            })
            .collect()
    }

    /// Stable SHA-256 hex digest of [`FlatGraph::adjacency`].
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (node, downstream) in self.adjacency() {
            hasher.update(node.as_bytes());
            hasher.update(b"->");
            hasher.update(downstream.join(",").as_bytes());
            hasher.update(b";");
        }
        format!("{:x}", hasher.finalize())
    }
}
