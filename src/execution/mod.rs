//! Execution layer: connectors, execution logs, leases and the orchestrator.

pub mod connector;
pub mod input;
pub mod lease;
pub mod log;
pub mod orchestrator;
pub mod retry;
pub mod sqlite;

pub use connector::{ConnectionConfig, Connector, ConnectorRegistry, MemoryConnector, NodeContext, NodeInput, Row};
pub use lease::{LeaseRegistry, RequestLease};
pub use log::{ExecutionLog, ExecutionLogStatus, ExecutionLogStore, MemoryExecutionLogStore, SqliteExecutionLogStore};
pub use orchestrator::{CancellationFlag, GraphOrchestrator, NodeOutcome, RequestOutcome};
pub use retry::with_retries;
pub use sqlite::SqliteConnector;
