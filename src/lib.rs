//! Privacy request execution engine
//!
//! Plans and runs privacy requests over a graph of data collections:
//! - Field-level dependency normalization of dataset edge declarations
//! - Deterministic traversal planning from the identity root
//! - Concurrent access, erasure and consent passes against pluggable connectors
//! - Consent propagation decisions with per-system reporting status

pub mod config;
pub mod consent;
pub mod error;
pub mod execution;
pub mod graph;
pub mod masking;
pub mod policy;
pub mod request;
pub mod taxonomy;

// Re-exports for convenience
pub use config::EngineConfig;
pub use error::{ConnectorError, GraphError, LeaseError, MaskingError, OrchestrationError};
pub use execution::{CancellationFlag, GraphOrchestrator, RequestOutcome};
pub use graph::{format_traversal_map, CollectionAddress, DatasetGraph, Traversal, TraversalMap};
pub use request::{Identity, PrivacyRequest, RequestStatus};
