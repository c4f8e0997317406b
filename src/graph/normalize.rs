//! Field-level dependency map
//!
//! Flattens a traversal map into one entry per qualified field:
//!
//! ```text
//! "postgres_db:order_item.order_id": {
//!     "upstream":   ["postgres_db:orders_export.order_id"],
//!     "downstream": ["postgres_db:orders.id"]
//! }
//! ```
//!
//! The map is oriented for erasure, which works backwards from the fields farthest
//! away from the identity:
//! - `upstream` holds the fields that consumed this field's values. They have already been
//!   erased by the time this field is reached.
//! - `downstream` holds the fields this field's values were read from, and are erased next.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::dataset::{execution_edges, TraversalMap};
use super::reference::Edge;
use crate::error::GraphError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDependencies {
    #[serde(default)]
    pub upstream: BTreeSet<String>,
    #[serde(default)]
    pub downstream: BTreeSet<String>,
}

/// Keyed by `"dataset:collection.field"`, sorted lexicographically.
pub type FieldDependencyMap = BTreeMap<String, FieldDependencies>;

pub fn format_traversal_map(map: &TraversalMap) -> Result<FieldDependencyMap, GraphError> {
    Ok(fold_edges(&execution_edges(map)?))
}

pub(crate) fn fold_edges<'a>(edges: impl IntoIterator<Item = &'a Edge>) -> FieldDependencyMap {
    let mut references = FieldDependencyMap::new();
    for edge in edges {
        let source = edge.from.to_string();
        let consumer = edge.to.to_string();

        references
            .entry(consumer.clone())
            .or_default()
            .downstream
            .insert(source.clone());
        references.entry(source).or_default().upstream.insert(consumer);
    }
    references
}
