//! Error taxonomy for graph planning, connectors and orchestration.

use thiserror::Error;

use crate::graph::CollectionAddress;

fn join_addresses(addresses: &[CollectionAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fatal problems with the dataset graph. Raised before any connector is called.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An edge declaration that cannot be parsed (missing field pair, bad address, ...)
    #[error("graph format error: {0}")]
    Format(String),
    /// Collections that depend on each other with no acyclic path
    #[error("dependency cycle between {}", join_addresses(.members))]
    Cycle { members: Vec<CollectionAddress> },
    /// Only raised when full coverage of the graph is required
    #[error("collections unreachable from the identity root: {}", join_addresses(.addresses))]
    Unreachable { addresses: Vec<CollectionAddress> },
}

impl GraphError {
    pub fn format(message: impl Into<String>) -> Self {
        GraphError::Format(message.into())
    }
}

/// Failures reported by a connector call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// Timeouts, rate limits, dropped connections. Retried with backoff.
    #[error("transient connector failure: {0}")]
    Transient(String),
    /// Auth failures, schema mismatches. Never retried.
    #[error("connector failure: {0}")]
    Fatal(String),
    #[error("connector does not support {0}")]
    Unsupported(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MaskingError {
    #[error("no masking strategy registered under `{0}`")]
    NoSuchStrategy(String),
    #[error("invalid configuration for masking strategy `{strategy}`: {reason}")]
    InvalidConfiguration { strategy: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("privacy request {0} is already being processed")]
    AlreadyHeld(String),
    #[error("lease file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort a privacy request before or outside node execution.
/// Node-level failures never surface here; they are kept in the request outcome.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Masking(#[from] MaskingError),
    #[error("execution log store failure: {0}")]
    Storage(#[from] anyhow::Error),
}
