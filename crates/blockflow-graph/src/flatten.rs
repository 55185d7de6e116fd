//! Inlining of nested subgraphs.
//!
//! Each pass replaces every subgraph node with its children (keys become
//! `parent.child`), pushes the parent's inputs down to the children that
//! receive them, and redirects references to the parent onto its output
//! child. Passes repeat until no node owns a subgraph.

use std::collections::HashMap;

use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::types::STDIN_PORT;

use crate::node::{GraphDef, NodeDef, UpstreamRef};

/// Flatten `graph` until no node owns a subgraph.
pub fn flatten(graph: &GraphDef) -> Result<GraphDef> {
    let mut nodes = graph.nodes.clone();
    let mut passes = 0;
    while nodes.iter().any(NodeDef::is_subgraph) {
        nodes = flatten_once(nodes)?;
        passes += 1;
    }
    if passes > 0 {
        debug!(passes, nodes = nodes.len(), "Flattened graph");
    }
    GraphDef::new(nodes)
}

/// Where references to a subgraph node are redirected.
enum Stdout {
    Child(String),
    Ambiguous(String),
}

fn flatten_once(nodes: Vec<NodeDef>) -> Result<Vec<NodeDef>> {
    let mut stdout_lookup: HashMap<String, Stdout> = HashMap::new();
    let mut flattened: Vec<NodeDef> = Vec::with_capacity(nodes.len());

    for parent in nodes {
        if !parent.is_subgraph() {
            flattened.push(parent);
            continue;
        }
        stdout_lookup.insert(parent.key.clone(), stdout_child(&parent));
        flattened.extend(inline_children(parent)?);
    }

    for node in &mut flattened {
        for upstream in node.inputs.values_mut() {
            let r = UpstreamRef::parse(upstream);
            match stdout_lookup.get(&r.node) {
                Some(Stdout::Child(child)) => *upstream = r.with_node(child.clone()).to_string(),
                Some(Stdout::Ambiguous(msg)) => {
                    return Err(BlockflowError::Graph(format!(
                        "node {} reads from {}: {}",
                        node.key, r.node, msg
                    )))
                }
                None => {}
            }
        }
    }
    Ok(flattened)
}

/// Qualify `parent`'s children and push its inputs down to them.
fn inline_children(parent: NodeDef) -> Result<Vec<NodeDef>> {
    let prefix = format!("{}.", parent.key);
    let stdin_child = stdin_child(&parent);

    let mut children: Vec<NodeDef> = parent
        .nodes
        .iter()
        .cloned()
        .map(|mut child| {
            child.inputs = child
                .inputs
                .into_iter()
                .map(|(port, upstream)| {
                    let r = UpstreamRef::parse(&upstream);
                    (port, r.with_node(format!("{}{}", prefix, r.node)).to_string())
                })
                .collect();
            if child.schedule.is_none() {
                child.schedule = parent.schedule.clone();
            }
            child
        })
        .collect();

    for (port, upstream) in &parent.inputs {
        let (child_key, child_port) = if port == STDIN_PORT {
            let child = stdin_child.clone().map_err(BlockflowError::Graph)?;
            (child, STDIN_PORT.to_string())
        } else {
            boundary_target(&parent, port)?
        };
        let child = children
            .iter_mut()
            .find(|c| c.key == child_key)
            .ok_or_else(|| BlockflowError::not_found("Node", format!("{}{}", prefix, child_key)))?;
        child.inputs.insert(child_port, upstream.clone());
    }

    for child in &mut children {
        child.key = format!("{}{}", prefix, child.key);
    }
    Ok(children)
}

/// Resolve a boundary port `child` or `child.port` to a child and its port.
fn boundary_target(parent: &NodeDef, port: &str) -> Result<(String, String)> {
    parent
        .nodes
        .iter()
        .filter_map(|c| {
            if port == c.key {
                Some((c.key.clone(), STDIN_PORT.to_string()))
            } else {
                port.strip_prefix(&format!("{}.", c.key))
                    .map(|rest| (c.key.clone(), rest.to_string()))
            }
        })
        .max_by_key(|(key, _)| key.len())
        .ok_or_else(|| {
            BlockflowError::Graph(format!(
                "subgraph {} has no child receiving input {}",
                parent.key, port
            ))
        })
}

fn stdin_child(parent: &NodeDef) -> std::result::Result<String, String> {
    if let Some(key) = &parent.stdin_key {
        return Ok(key.clone());
    }
    if let [only] = parent.nodes.as_slice() {
        return Ok(only.key.clone());
    }
    let mut open = parent.nodes.iter().filter(|c| c.inputs.is_empty());
    match (open.next(), open.next()) {
        (Some(child), None) => Ok(child.key.clone()),
        _ => Err(format!(
            "subgraph {} has several possible stdin children; set stdin_key",
            parent.key
        )),
    }
}

fn stdout_child(parent: &NodeDef) -> Stdout {
    let qualify = |child: &str| format!("{}.{}", parent.key, child);
    if let Some(key) = &parent.stdout_key {
        return Stdout::Child(qualify(key));
    }
    let consumed: Vec<String> = parent
        .nodes
        .iter()
        .flat_map(|c| c.inputs.values().map(|u| UpstreamRef::parse(u).node))
        .collect();
    let mut sinks = parent.nodes.iter().filter(|c| !consumed.contains(&c.key));
    match (sinks.next(), sinks.next()) {
        (Some(child), None) => Stdout::Child(qualify(&child.key)),
        _ => Stdout::Ambiguous(format!(
            "subgraph {} has several possible stdout children; set stdout_key",
            parent.key
        )),
    }
}
