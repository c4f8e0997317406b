//! Dataset graph, field-level normalization and traversal planning.

pub mod address;
pub mod dataset;
pub mod normalize;
pub mod reference;
pub mod traversal;

pub use address::{CollectionAddress, FieldAddress, ROOT_NAME};
pub use dataset::{execution_edges, Collection, DatasetGraph, EdgeDeclaration, Field, GraphNode, TraversalMap};
pub use normalize::{format_traversal_map, FieldDependencies, FieldDependencyMap};
pub use reference::{Edge, FieldPair};
pub use traversal::{NodeDependencies, Traversal, UnreachableNode, UnreachableReason};
