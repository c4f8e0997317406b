//! Dataset graph: declared collections, their schemas and their reference edges.
//!
//! The graph is an arena of nodes indexed by [`CollectionAddress`], built once from the
//! persisted dataset definitions. Nothing here reaches back into storage.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::address::CollectionAddress;
use super::reference::{Edge, FieldPair};
use crate::error::GraphError;

/// Raw bidirectional edge declaration of one collection.
///
/// `from[R] = {"f -> l"}`: this collection's `l` takes its values from `R.f`.
/// `to[R] = {"l -> f"}`: this collection's `l` feeds `R.f`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDeclaration {
    #[serde(default)]
    pub from: BTreeMap<CollectionAddress, BTreeSet<String>>,
    #[serde(default)]
    pub to: BTreeMap<CollectionAddress, BTreeSet<String>>,
}

/// The shape produced by the dataset configuration layer.
pub type TraversalMap = BTreeMap<CollectionAddress, EdgeDeclaration>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub data_categories: Vec<String>,
    #[serde(default)]
    pub primary_key: bool,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_categories: Vec::new(),
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.data_categories.push(category.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Collection {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.primary_key)
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub address: CollectionAddress,
    pub edges: EdgeDeclaration,
    pub collection: Option<Collection>,
}

#[derive(Debug, Clone)]
pub struct DatasetGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<CollectionAddress, usize>,
    /// dataset name -> connection key
    connections: HashMap<String, String>,
}

impl DatasetGraph {
    /// Build the graph from a traversal map. The root node is always present,
    /// whether or not the map declares it.
    pub fn from_traversal_map(map: TraversalMap) -> Self {
        let mut graph = Self {
            nodes: Vec::with_capacity(map.len() + 1),
            index: HashMap::new(),
            connections: HashMap::new(),
        };
        graph.insert(CollectionAddress::root(), EdgeDeclaration::default());
        for (address, edges) in map {
            graph.insert(address, edges);
        }
        graph
    }

    fn insert(&mut self, address: CollectionAddress, edges: EdgeDeclaration) -> usize {
        if let Some(&idx) = self.index.get(&address) {
            self.nodes[idx].edges = edges;
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(address.clone(), idx);
        self.nodes.push(GraphNode {
            address,
            edges,
            collection: None,
        });
        idx
    }

    /// Attach a collection schema. Declares the node if the map did not.
    pub fn with_collection(mut self, dataset: &str, collection: Collection) -> Self {
        let address = CollectionAddress::new(dataset, collection.name.clone());
        let idx = match self.index.get(&address) {
            Some(&idx) => idx,
            None => self.insert(address, EdgeDeclaration::default()),
        };
        self.nodes[idx].collection = Some(collection);
        self
    }

    /// Route every collection of `dataset` to the connection registered as `connection_key`.
    pub fn bind_dataset(mut self, dataset: impl Into<String>, connection_key: impl Into<String>) -> Self {
        self.connections.insert(dataset.into(), connection_key.into());
        self
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&GraphNode> {
        self.index.get(address).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, address: &CollectionAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn connection_for(&self, address: &CollectionAddress) -> Option<&str> {
        self.connections.get(&address.dataset).map(String::as_str)
    }

    /// Re-export the declarations in traversal map form.
    pub fn traversal_map(&self) -> TraversalMap {
        self.nodes
            .iter()
            .map(|node| (node.address.clone(), node.edges.clone()))
            .collect()
    }

    /// Identity fields the root hands out to other collections.
    pub fn root_identity_fields(&self) -> Result<BTreeSet<String>, GraphError> {
        Ok(execution_edges(&self.traversal_map())?
            .into_iter()
            .filter(|edge| edge.from.collection.is_root())
            .map(|edge| edge.from.path)
            .collect())
    }
}

fn parse_pairs(
    owner: &CollectionAddress,
    direction: &str,
    related: &CollectionAddress,
    raw: &BTreeSet<String>,
) -> Result<Vec<FieldPair>, GraphError> {
    if raw.is_empty() {
        return Err(GraphError::format(format!(
            "`{}` declares a `{}` reference to `{}` without any field pair",
            owner, direction, related
        )));
    }
    raw.iter().map(|pair| pair.parse()).collect()
}

/// Normalize both declaration directions into one set of execution edges.
///
/// `from` entries and the matching `to` entries of the other side describe the same edge,
/// so the set union collapses them.
pub fn execution_edges(map: &TraversalMap) -> Result<BTreeSet<Edge>, GraphError> {
    let mut edges = BTreeSet::new();

    for (address, declaration) in map {
        for (related, raw) in &declaration.from {
            for pair in parse_pairs(address, "from", related, raw)? {
                edges.insert(Edge {
                    from: related.field(pair.source),
                    to: address.field(pair.target),
                });
            }
        }
        for (related, raw) in &declaration.to {
            for pair in parse_pairs(address, "to", related, raw)? {
                edges.insert(Edge {
                    from: address.field(pair.source),
                    to: related.field(pair.target),
                });
            }
        }
    }

    Ok(edges)
}
