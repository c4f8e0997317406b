//! Traversal planner
//!
//! Turns a [`DatasetGraph`] and the seed identity into the node-level execution plan:
//! which collections run, which collections each one waits on, and one deterministic
//! topological order (ready nodes are released by address).

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use tracing::{debug, warn};

use super::address::CollectionAddress;
use super::dataset::{execution_edges, DatasetGraph};
use super::normalize::{fold_edges, FieldDependencyMap};
use super::reference::Edge;
use crate::error::GraphError;
use crate::request::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableReason {
    /// Declared, but no path leads to it from the identity root
    NoPathFromRoot,
    /// Referenced by another collection but never declared
    Undeclared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreachableNode {
    pub address: CollectionAddress,
    pub reason: UnreachableReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeDependencies {
    /// Collections that must complete before this one
    pub upstream: BTreeSet<CollectionAddress>,
    /// Collections consuming this one's rows
    pub downstream: BTreeSet<CollectionAddress>,
}

#[derive(Debug, Clone)]
pub struct Traversal {
    order: Vec<CollectionAddress>,
    nodes: BTreeMap<CollectionAddress, NodeDependencies>,
    incoming: BTreeMap<CollectionAddress, Vec<Edge>>,
    field_map: FieldDependencyMap,
    unreachable: Vec<UnreachableNode>,
}

impl Traversal {
    pub fn new(graph: &DatasetGraph, seed: &Identity) -> Result<Self, GraphError> {
        let all_edges = execution_edges(&graph.traversal_map())?;
        let field_map = fold_edges(&all_edges);

        if let Some(edge) = all_edges.iter().find(|e| e.to.collection.is_root()) {
            return Err(GraphError::format(format!(
                "the identity root cannot take values from another collection ({})",
                edge
            )));
        }

        let mut undeclared = BTreeSet::new();
        let mut declared_edges = Vec::with_capacity(all_edges.len());
        for edge in all_edges {
            let mut dangling = false;
            for address in [&edge.from.collection, &edge.to.collection] {
                if !graph.contains(address) {
                    undeclared.insert(address.clone());
                    dangling = true;
                }
            }
            if !dangling {
                declared_edges.push(edge);
            }
        }

        detect_cycles(graph, &declared_edges)?;

        // Root edges only carry identity values the requester actually supplied.
        let active_edges: Vec<Edge> = declared_edges
            .into_iter()
            .filter(|edge| {
                !edge.from.collection.is_root()
                    || seed.get(&edge.from.path).is_some_and(|v| !v.is_null())
            })
            .collect();

        let mut children: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>> = BTreeMap::new();
        for edge in &active_edges {
            children
                .entry(edge.from.collection.clone())
                .or_default()
                .insert(edge.to.collection.clone());
        }

        let root = CollectionAddress::root();
        let mut reachable = BTreeSet::from([root.clone()]);
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            for child in children.get(&current).into_iter().flatten() {
                if reachable.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }

        let mut nodes: BTreeMap<CollectionAddress, NodeDependencies> = reachable
            .iter()
            .map(|address| (address.clone(), NodeDependencies::default()))
            .collect();
        let mut incoming: BTreeMap<CollectionAddress, Vec<Edge>> = BTreeMap::new();
        for edge in active_edges {
            let (from, to) = (&edge.from.collection, &edge.to.collection);
            if !reachable.contains(from) || !reachable.contains(to) {
                continue;
            }
            if let Some(deps) = nodes.get_mut(to) {
                deps.upstream.insert(from.clone());
            }
            if let Some(deps) = nodes.get_mut(from) {
                deps.downstream.insert(to.clone());
            }
            incoming.entry(to.clone()).or_default().push(edge);
        }

        let order = topological_order(&nodes);

        let mut unreachable: Vec<UnreachableNode> = graph
            .nodes()
            .filter(|node| !reachable.contains(&node.address))
            .map(|node| UnreachableNode {
                address: node.address.clone(),
                reason: UnreachableReason::NoPathFromRoot,
            })
            .chain(undeclared.into_iter().map(|address| UnreachableNode {
                address,
                reason: UnreachableReason::Undeclared,
            }))
            .collect();
        unreachable.sort_by(|a, b| a.address.cmp(&b.address));

        for node in &unreachable {
            warn!(address = %node.address, reason = ?node.reason, "Collection will not be visited");
        }
        debug!(nodes = order.len(), "Traversal planned");

        Ok(Self {
            order,
            nodes,
            incoming,
            field_map,
            unreachable,
        })
    }

    /// Access order, root first.
    pub fn order(&self) -> &[CollectionAddress] {
        &self.order
    }

    /// Erasure order: the access order reversed, without the root.
    pub fn erasure_order(&self) -> Vec<CollectionAddress> {
        self.order.iter().rev().filter(|a| !a.is_root()).cloned().collect()
    }

    pub fn dependencies(&self, address: &CollectionAddress) -> Option<&NodeDependencies> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> &BTreeMap<CollectionAddress, NodeDependencies> {
        &self.nodes
    }

    /// Field edges feeding `address`, sorted.
    pub fn incoming_edges(&self, address: &CollectionAddress) -> &[Edge] {
        self.incoming.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn field_map(&self) -> &FieldDependencyMap {
        &self.field_map
    }

    pub fn unreachable(&self) -> &[UnreachableNode] {
        &self.unreachable
    }

    pub fn is_reachable(&self, address: &CollectionAddress) -> bool {
        self.nodes.contains_key(address)
    }
}

fn detect_cycles(graph: &DatasetGraph, edges: &[Edge]) -> Result<(), GraphError> {
    let mut dependency_graph: DiGraph<CollectionAddress, ()> = DiGraph::new();
    let mut indices: HashMap<CollectionAddress, NodeIndex> = HashMap::new();
    for node in graph.nodes() {
        indices.insert(node.address.clone(), dependency_graph.add_node(node.address.clone()));
    }

    let mut self_referencing = BTreeSet::new();
    let mut seen = BTreeSet::new();
    for edge in edges {
        let (from, to) = (&edge.from.collection, &edge.to.collection);
        if from == to {
            self_referencing.insert(from.clone());
            continue;
        }
        if seen.insert((from.clone(), to.clone())) {
            dependency_graph.add_edge(indices[from], indices[to], ());
        }
    }

    let mut members: BTreeSet<CollectionAddress> = self_referencing;
    for component in kosaraju_scc(&dependency_graph) {
        if component.len() > 1 {
            members.extend(component.into_iter().map(|idx| dependency_graph[idx].clone()));
        }
    }

    if members.is_empty() {
        Ok(())
    } else {
        Err(GraphError::Cycle {
            members: members.into_iter().collect(),
        })
    }
}

// Kahn's algorithm; among ready nodes the smallest address goes first.
fn topological_order(nodes: &BTreeMap<CollectionAddress, NodeDependencies>) -> Vec<CollectionAddress> {
    let mut remaining: BTreeMap<&CollectionAddress, usize> = nodes
        .iter()
        .map(|(address, deps)| (address, deps.upstream.len()))
        .collect();

    let mut ready: BinaryHeap<Reverse<&CollectionAddress>> = remaining
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&address, _)| Reverse(address))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(address)) = ready.pop() {
        order.push(address.clone());
        for child in &nodes[address].downstream {
            if let Some(count) = remaining.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(child));
                }
            }
        }
    }
    order
}
