//! Collection and field addresses
//!
//! A collection is addressed as `dataset:collection`; a field inside it as
//! `dataset:collection.path`, where the path may itself be dotted for nested documents.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Reserved dataset and collection name of the identity root.
pub const ROOT_NAME: &str = "__ROOT__";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    /// The synthetic `__ROOT__:__ROOT__` node holding the seed identity
    pub fn root() -> Self {
        Self::new(ROOT_NAME, ROOT_NAME)
    }

    pub fn is_root(&self) -> bool {
        self.dataset == ROOT_NAME && self.collection == ROOT_NAME
    }

    pub fn field(&self, path: impl Into<String>) -> FieldAddress {
        FieldAddress {
            collection: self.clone(),
            path: path.into(),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

impl FromStr for CollectionAddress {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':').map(|(dataset, collection)| (dataset.trim(), collection.trim())) {
            Some((dataset, collection)) if !dataset.is_empty() && !collection.is_empty() => {
                Ok(Self::new(dataset, collection))
            }
            _ => Err(GraphError::format(format!(
                "`{}` is not a collection address (expected `dataset:collection`)",
                s
            ))),
        }
    }
}

impl TryFrom<String> for CollectionAddress {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CollectionAddress> for String {
    fn from(address: CollectionAddress) -> Self {
        address.to_string()
    }
}

// Ordered by the rendered `dataset:collection` string so that every tie-break
// in the planner matches what an operator sees in logs.
impl Ord for CollectionAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string()
            .cmp(&other.to_string())
            .then_with(|| self.dataset.cmp(&other.dataset))
            .then_with(|| self.collection.cmp(&other.collection))
    }
}

impl PartialOrd for CollectionAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A (possibly nested) field of a collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldAddress {
    pub collection: CollectionAddress,
    pub path: String,
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.path)
    }
}
