//! Field-level references between collections.

use std::fmt;
use std::str::FromStr;

use super::address::FieldAddress;
use crate::error::GraphError;

const PAIR_SEPARATOR: &str = " -> ";

/// One `"source -> target"` entry of a `from`/`to` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPair {
    pub source: String,
    pub target: String,
}

impl FromStr for FieldPair {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((source, target)) = s.split_once(PAIR_SEPARATOR) else {
            return Err(GraphError::format(format!(
                "field pair `{}` must look like `source -> target`",
                s
            )));
        };

        let (source, target) = (source.trim(), target.trim());
        if source.is_empty() || target.is_empty() {
            return Err(GraphError::format(format!("field pair `{}` has an empty side", s)));
        }

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
        })
    }
}

impl fmt::Display for FieldPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source, PAIR_SEPARATOR, self.target)
    }
}

/// A directed field edge in execution orientation: values read at `from` become
/// the lookup values for `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: FieldAddress,
    pub to: FieldAddress,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}
