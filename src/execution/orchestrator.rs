//! Privacy request orchestration
//!
//! Runs a request against the planned traversal in three passes:
//!
//! 1. access: every reachable collection, parents before children, rows of each parent
//!    feeding the input of its children;
//! 2. erasure: the same DAG reversed, masking the rows found by the access pass;
//! 3. consent: one propagation decision per consent-capable connection.
//!
//! Independent subtrees run concurrently on the tokio runtime, bounded by
//! `execution.max_concurrency`. A node only starts once every node it depends on is
//! `complete`; a failed or skipped dependency marks it `skipped`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::connector::{ConnectionConfig, Connector, ConnectorRegistry, NodeContext, NodeInput, Row};
use super::input::{build_node_input, is_empty_input, values_at_mut};
use super::lease::LeaseRegistry;
use super::log::{ExecutionLog, ExecutionLogStatus, ExecutionLogStore, MemoryExecutionLogStore, SqliteExecutionLogStore};
use super::retry::with_retries;
use crate::config::{EngineConfig, RetryConfig};
use crate::consent::{
    add_complete_system_status_for_consent_reporting, add_errored_system_status_for_consent_reporting,
    add_skipped_system_status_for_consent_reporting, cache_initial_status_and_identities_for_consent_reporting,
    should_opt_in_to_service, PrivacyPreferenceHistory,
};
use crate::error::{ConnectorError, GraphError, MaskingError, OrchestrationError};
use crate::graph::{Collection, CollectionAddress, DatasetGraph, Traversal, UnreachableNode};
use crate::masking::MaskingStrategyRegistry;
use crate::policy::{ActionType, MaskingSpec, Policy};
use crate::request::{Identity, PrivacyRequest, RequestStatus};

const CANCELLED: &str = "request cancelled";

// ──────────────────────────────────────────────────────────────────────────────
// OUTCOMES
// ──────────────────────────────────────────────────────────────────────────────

/// Cooperative cancellation, checked between node executions.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub status: ExecutionLogStatus,
    pub message: Option<String>,
    /// Rows returned (access) or updated (erasure)
    pub rows: usize,
}

impl NodeOutcome {
    pub fn complete(rows: usize) -> Self {
        Self {
            status: ExecutionLogStatus::Complete,
            message: None,
            rows,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionLogStatus::Error,
            message: Some(message.into()),
            rows: 0,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionLogStatus::Skipped,
            message: Some(message.into()),
            rows: 0,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub privacy_request_id: String,
    pub status: RequestStatus,
    pub access: BTreeMap<CollectionAddress, NodeOutcome>,
    pub erasure: BTreeMap<CollectionAddress, NodeOutcome>,
    /// Keyed by connection key
    pub consent: BTreeMap<String, NodeOutcome>,
    pub access_results: BTreeMap<CollectionAddress, Vec<Row>>,
    pub rows_masked: BTreeMap<CollectionAddress, usize>,
    pub unreachable: Vec<UnreachableNode>,
    pub privacy_preferences: Vec<PrivacyPreferenceHistory>,
}

impl RequestOutcome {
    fn new(privacy_request_id: &str) -> Self {
        Self {
            privacy_request_id: privacy_request_id.to_string(),
            status: RequestStatus::InProcessing,
            access: BTreeMap::new(),
            erasure: BTreeMap::new(),
            consent: BTreeMap::new(),
            access_results: BTreeMap::new(),
            rows_masked: BTreeMap::new(),
            unreachable: Vec::new(),
            privacy_preferences: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.access
            .values()
            .chain(self.erasure.values())
            .chain(self.consent.values())
            .any(|node| node.status == ExecutionLogStatus::Error)
    }

    /// `(phase, node, message)` of every node that ended in error.
    pub fn errors(&self) -> Vec<(ActionType, String, String)> {
        let graph_errors = [(ActionType::Access, &self.access), (ActionType::Erasure, &self.erasure)]
            .into_iter()
            .flat_map(|(action, nodes)| {
                nodes
                    .iter()
                    .map(move |(address, node)| (action, address.to_string(), node))
            });
        let consent_errors = self
            .consent
            .iter()
            .map(|(key, node)| (ActionType::Consent, key.clone(), node));

        graph_errors
            .chain(consent_errors)
            .filter(|(_, _, node)| node.status == ExecutionLogStatus::Error)
            .map(|(action, name, node)| (action, name, node.message.clone().unwrap_or_default()))
            .collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// SCHEDULING
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Released {
    ready: Vec<CollectionAddress>,
    /// Node and the first dependency that did not complete
    blocked: Vec<(CollectionAddress, CollectionAddress)>,
}

/// Releases nodes once all of their dependencies have finished.
struct PhaseScheduler {
    dependencies: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
    pending: BTreeSet<CollectionAddress>,
    finished: BTreeMap<CollectionAddress, ExecutionLogStatus>,
}

impl PhaseScheduler {
    fn new(dependencies: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>) -> Self {
        Self {
            pending: dependencies.keys().cloned().collect(),
            dependencies,
            finished: BTreeMap::new(),
        }
    }

    fn finish(&mut self, address: &CollectionAddress, status: ExecutionLogStatus) {
        self.pending.remove(address);
        self.finished.insert(address.clone(), status);
    }

    fn release(&mut self) -> Released {
        let candidates: Vec<CollectionAddress> = self
            .pending
            .iter()
            .filter(|address| {
                self.dependencies
                    .get(*address)
                    .into_iter()
                    .flatten()
                    .all(|dep| self.finished.contains_key(dep))
            })
            .cloned()
            .collect();

        let mut released = Released::default();
        for address in candidates {
            self.pending.remove(&address);
            let failed_dependency = self.dependencies.get(&address).into_iter().flatten().find(|dep| {
                self.finished.get(*dep) != Some(&ExecutionLogStatus::Complete)
            });
            match failed_dependency {
                Some(dep) => released.blocked.push((address.clone(), dep.clone())),
                None => released.ready.push(address),
            }
        }
        released
    }

    fn take_pending(&mut self) -> Vec<CollectionAddress> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

enum Step<T> {
    /// Completed by an earlier run of the same request; nothing is logged
    Resumed(NodeOutcome),
    /// Decided without calling a connector
    Finished(NodeOutcome),
    Spawn(BoxFuture<'static, Result<T, ConnectorError>>),
}

#[async_trait]
trait PhaseRunner: Send {
    type Output: Send + 'static;

    fn action(&self) -> ActionType;

    async fn prepare(&mut self, address: &CollectionAddress) -> Result<Step<Self::Output>, OrchestrationError>;

    async fn finish(
        &mut self,
        address: &CollectionAddress,
        output: Self::Output,
    ) -> Result<NodeOutcome, OrchestrationError>;
}

// ──────────────────────────────────────────────────────────────────────────────
// ORCHESTRATOR
// ──────────────────────────────────────────────────────────────────────────────

pub struct GraphOrchestrator {
    config: Arc<EngineConfig>,
    connectors: Arc<ConnectorRegistry>,
    log_store: Arc<dyn ExecutionLogStore>,
    leases: LeaseRegistry,
    masking: Arc<MaskingStrategyRegistry>,
}

impl GraphOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        connectors: Arc<ConnectorRegistry>,
        log_store: Arc<dyn ExecutionLogStore>,
    ) -> Self {
        Self {
            leases: LeaseRegistry::new(config.storage.lease_dir.clone()),
            config,
            connectors,
            log_store,
            masking: Arc::new(MaskingStrategyRegistry::new()),
        }
    }

    /// Build from configuration, opening the SQLite execution log when one is configured.
    pub async fn from_config(config: EngineConfig, connectors: Arc<ConnectorRegistry>) -> anyhow::Result<Self> {
        let log_store: Arc<dyn ExecutionLogStore> = match &config.storage.sqlite_path {
            Some(path) => Arc::new(SqliteExecutionLogStore::new(path).await?),
            None => Arc::new(MemoryExecutionLogStore::new()),
        };
        Ok(Self::new(Arc::new(config), connectors, log_store))
    }

    /// Share one lease registry between orchestrators of the same process.
    pub fn with_leases(mut self, leases: LeaseRegistry) -> Self {
        self.leases = leases;
        self
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    pub fn log_store(&self) -> &Arc<dyn ExecutionLogStore> {
        &self.log_store
    }

    pub async fn run_privacy_request(
        &self,
        request: &mut PrivacyRequest,
        graph: &DatasetGraph,
        cancel: &CancellationFlag,
    ) -> Result<RequestOutcome, OrchestrationError> {
        let _lease = self.leases.acquire(&request.id)?;
        info!(privacy_request_id = %request.id, policy = %request.policy.key, "Running privacy request");

        for rule in request.policy.rules_for(ActionType::Erasure) {
            self.masking.validate(&rule.masking_strategy)?;
        }

        request.status = RequestStatus::InProcessing;
        let mut outcome = RequestOutcome::new(&request.id);

        let policy = &request.policy;
        if policy.has_rules_for(ActionType::Access) || policy.has_rules_for(ActionType::Erasure) {
            let traversal = Traversal::new(graph, &request.identity)?;
            if self.config.execution.require_full_coverage && !traversal.unreachable().is_empty() {
                return Err(GraphError::Unreachable {
                    addresses: traversal.unreachable().iter().map(|n| n.address.clone()).collect(),
                }
                .into());
            }
            outcome.unreachable = traversal.unreachable().to_vec();

            let mut access = AccessRunner {
                orchestrator: self,
                request,
                graph,
                traversal: &traversal,
                rows: BTreeMap::new(),
            };
            access.rows.insert(CollectionAddress::root(), vec![identity_row(&request.identity)]);
            let dependencies = traversal
                .nodes()
                .iter()
                .map(|(address, deps)| (address.clone(), deps.upstream.clone()))
                .collect();
            outcome.access = self
                .drive_phase(&request.id, &mut access, dependencies, &[CollectionAddress::root()], cancel)
                .await?;
            outcome.access_results = access.rows;
            outcome.access_results.remove(&CollectionAddress::root());

            if policy.has_rules_for(ActionType::Erasure) && !cancel.is_cancelled() {
                let mut erasure = ErasureRunner {
                    orchestrator: self,
                    request,
                    graph,
                    access: &outcome.access,
                    rows: &outcome.access_results,
                };
                let dependencies = traversal
                    .nodes()
                    .iter()
                    .filter(|(address, _)| !address.is_root())
                    .map(|(address, deps)| (address.clone(), deps.downstream.clone()))
                    .collect();
                let erased = self
                    .drive_phase(&request.id, &mut erasure, dependencies, &[], cancel)
                    .await?;
                outcome.rows_masked = erased
                    .iter()
                    .filter(|(_, node)| node.status == ExecutionLogStatus::Complete)
                    .map(|(address, node)| (address.clone(), node.rows))
                    .collect();
                outcome.erasure = erased;
            }
        }

        if request.policy.has_rules_for(ActionType::Consent) && !cancel.is_cancelled() {
            outcome.consent = self.run_consent(request, cancel).await?;
        }

        let status = if cancel.is_cancelled() {
            RequestStatus::Canceled
        } else if outcome.has_errors() {
            RequestStatus::Error
        } else {
            RequestStatus::Complete
        };
        request.status = status;
        outcome.status = status;
        outcome.privacy_preferences = request.privacy_preferences.clone();

        match status {
            RequestStatus::Complete => info!(privacy_request_id = %request.id, "Privacy request complete"),
            _ => warn!(
                privacy_request_id = %request.id,
                ?status,
                errors = outcome.errors().len(),
                "Privacy request finished without completing"
            ),
        }
        Ok(outcome)
    }

    async fn drive_phase<R: PhaseRunner>(
        &self,
        request_id: &str,
        runner: &mut R,
        dependencies: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
        preset: &[CollectionAddress],
        cancel: &CancellationFlag,
    ) -> Result<BTreeMap<CollectionAddress, NodeOutcome>, OrchestrationError> {
        let action = runner.action();
        let max_concurrency = self.config.execution.max_concurrency.max(1);
        let mut scheduler = PhaseScheduler::new(dependencies);
        for address in preset {
            scheduler.finish(address, ExecutionLogStatus::Complete);
        }

        let mut outcomes = BTreeMap::new();
        let mut ready: VecDeque<CollectionAddress> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            loop {
                let released = scheduler.release();
                if released == Released::default() {
                    break;
                }
                ready.extend(released.ready);
                for (address, cause) in released.blocked {
                    let node = NodeOutcome::skipped(format!("{} of {} did not complete", action, cause));
                    self.record(request_id, action, &address, &node).await?;
                    scheduler.finish(&address, node.status);
                    outcomes.insert(address, node);
                }
            }

            let mut progressed = false;
            while in_flight.len() < max_concurrency && !cancel.is_cancelled() {
                let Some(address) = ready.pop_front() else {
                    break;
                };
                progressed = true;
                match runner.prepare(&address).await? {
                    Step::Resumed(node) => {
                        info!(privacy_request_id = request_id, %address, %action, "Reusing result of an earlier run");
                        scheduler.finish(&address, node.status);
                        outcomes.insert(address, node);
                    }
                    Step::Finished(node) => {
                        self.record(request_id, action, &address, &node).await?;
                        scheduler.finish(&address, node.status);
                        outcomes.insert(address, node);
                    }
                    Step::Spawn(task) => {
                        self.write_log(request_id, action, &address.to_string(), ExecutionLogStatus::InProcessing, None)
                            .await?;
                        in_flight.push(tokio::spawn(task).map(move |joined| (address, joined)).boxed());
                    }
                }
            }

            if in_flight.is_empty() {
                if progressed && !cancel.is_cancelled() {
                    continue;
                }
                break;
            }

            if let Some((address, joined)) = in_flight.next().await {
                let node = if cancel.is_cancelled() {
                    NodeOutcome::error(CANCELLED)
                } else {
                    match joined {
                        Ok(Ok(output)) => runner.finish(&address, output).await?,
                        Ok(Err(e)) => NodeOutcome::error(e.to_string()),
                        Err(e) => NodeOutcome::error(format!("node task failed: {}", e)),
                    }
                };
                self.record(request_id, action, &address, &node).await?;
                scheduler.finish(&address, node.status);
                outcomes.insert(address, node);
            }
        }

        let reason = if cancel.is_cancelled() {
            CANCELLED
        } else {
            "dependencies never completed"
        };
        let remaining: Vec<CollectionAddress> = ready.into_iter().chain(scheduler.take_pending()).collect();
        for address in remaining {
            let node = NodeOutcome::skipped(reason);
            self.record(request_id, action, &address, &node).await?;
            outcomes.insert(address, node);
        }
        Ok(outcomes)
    }

    async fn run_consent(
        &self,
        request: &mut PrivacyRequest,
        cancel: &CancellationFlag,
    ) -> Result<BTreeMap<String, NodeOutcome>, OrchestrationError> {
        let mut outcomes = BTreeMap::new();
        let action = ActionType::Consent;

        for (connection, connector) in self.connectors.consent_connections().await {
            let key = connection.key.clone();
            if cancel.is_cancelled() {
                let node = NodeOutcome::skipped(CANCELLED);
                self.write_log(&request.id, action, &key, node.status, node.message.clone())
                    .await?;
                outcomes.insert(key, node);
                continue;
            }
            let system_key = connection.system_key().to_string();

            let previous = self.log_store.latest_status(&request.id, action, &key).await?;
            if previous == Some(ExecutionLogStatus::Complete) {
                info!(privacy_request_id = %request.id, connection_key = %key, "Consent already propagated");
                outcomes.insert(key, NodeOutcome::complete(0).with_message("resumed"));
                continue;
            }

            let decision = should_opt_in_to_service(connection.system.as_ref(), request);
            info!(
                privacy_request_id = %request.id,
                connection_key = %key,
                system_key = %system_key,
                action = ?decision.action,
                relevant = decision.relevant_preference_ids.len(),
                "Consent propagation decision"
            );

            let Some(consent_action) = decision.action else {
                add_skipped_system_status_for_consent_reporting(request, &system_key);
                let node = NodeOutcome::skipped("no relevant consent preferences");
                self.write_log(&request.id, action, &key, node.status, node.message.clone())
                    .await?;
                outcomes.insert(key, node);
                continue;
            };

            let identities = connector.consent_identities(&request.identity);
            cache_initial_status_and_identities_for_consent_reporting(
                request,
                &system_key,
                &decision.relevant_preference_ids,
                &identities,
            );
            self.write_log(&request.id, action, &key, ExecutionLogStatus::InProcessing, None)
                .await?;

            let result = {
                let (connector, connection, identity) = (&connector, &connection, &request.identity);
                with_retries(&self.config.execution.retry, "run_consent_request", move |_| {
                    connector.run_consent_request(connection, consent_action, identity)
                })
                .await
            };

            let node = match result {
                Ok(()) => {
                    add_complete_system_status_for_consent_reporting(request, &system_key);
                    NodeOutcome::complete(0)
                }
                Err(e) => {
                    add_errored_system_status_for_consent_reporting(request, &system_key);
                    NodeOutcome::error(e.to_string())
                }
            };
            self.write_log(&request.id, action, &key, node.status, node.message.clone())
                .await?;
            outcomes.insert(key, node);
        }
        Ok(outcomes)
    }

    /// Connection serving `address`, or the outcome to record when there is none.
    async fn resolve_connection(
        &self,
        graph: &DatasetGraph,
        address: &CollectionAddress,
    ) -> Result<(ConnectionConfig, Arc<dyn Connector>), NodeOutcome> {
        let Some(key) = graph.connection_for(address) else {
            return Err(NodeOutcome::error(format!(
                "no connection configured for dataset {}",
                address.dataset
            )));
        };
        let Some((config, connector)) = self.connectors.get(key).await else {
            return Err(NodeOutcome::error(format!("connection {} is not registered", key)));
        };
        if !config.enabled {
            return Err(NodeOutcome::skipped(format!("connection {} is disabled", key)));
        }
        Ok((config, connector))
    }

    async fn record(
        &self,
        request_id: &str,
        action: ActionType,
        address: &CollectionAddress,
        node: &NodeOutcome,
    ) -> Result<(), OrchestrationError> {
        match node.status {
            ExecutionLogStatus::Error => error!(
                privacy_request_id = request_id,
                %address,
                %action,
                "Node failed: {}",
                node.message.as_deref().unwrap_or_default()
            ),
            ExecutionLogStatus::Skipped => warn!(
                privacy_request_id = request_id,
                %address,
                %action,
                "Node skipped: {}",
                node.message.as_deref().unwrap_or_default()
            ),
            status => debug!(privacy_request_id = request_id, %address, %action, %status, rows = node.rows, "Node finished"),
        }
        self.write_log(request_id, action, &address.to_string(), node.status, node.message.clone())
            .await
    }

    async fn write_log(
        &self,
        request_id: &str,
        action: ActionType,
        address: &str,
        status: ExecutionLogStatus,
        message: Option<String>,
    ) -> Result<(), OrchestrationError> {
        self.log_store
            .write_log(ExecutionLog::new(request_id, address, action, status, message))
            .await?;
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// PHASES
// ──────────────────────────────────────────────────────────────────────────────

struct AccessRunner<'a> {
    orchestrator: &'a GraphOrchestrator,
    request: &'a PrivacyRequest,
    graph: &'a DatasetGraph,
    traversal: &'a Traversal,
    rows: BTreeMap<CollectionAddress, Vec<Row>>,
}

impl<'a> AccessRunner<'a> {
    async fn store_rows(&mut self, address: &CollectionAddress, rows: Vec<Row>) -> Result<NodeOutcome, OrchestrationError> {
        self.orchestrator
            .log_store
            .cache_access_rows(&self.request.id, &address.to_string(), &rows)
            .await?;
        let count = rows.len();
        self.rows.insert(address.clone(), rows);
        Ok(NodeOutcome::complete(count))
    }
}

#[async_trait]
impl<'a> PhaseRunner for AccessRunner<'a> {
    type Output = Vec<Row>;

    fn action(&self) -> ActionType {
        ActionType::Access
    }

    async fn prepare(&mut self, address: &CollectionAddress) -> Result<Step<Vec<Row>>, OrchestrationError> {
        let store = self.orchestrator.log_store.clone();
        let request_id = self.request.id.clone();
        let key = address.to_string();
        if store.latest_status(&request_id, ActionType::Access, &key).await? == Some(ExecutionLogStatus::Complete) {
            if let Some(rows) = store.cached_access_rows(&request_id, &key).await? {
                let count = rows.len();
                self.rows.insert(address.clone(), rows);
                return Ok(Step::Resumed(NodeOutcome::complete(count).with_message("resumed")));
            }
        }

        let (connection, connector) = match self.orchestrator.resolve_connection(self.graph, address).await {
            Ok(found) => found,
            Err(node) => return Ok(Step::Finished(node)),
        };

        let input = build_node_input(self.traversal.incoming_edges(address), &self.rows);
        if is_empty_input(&input) {
            debug!(privacy_request_id = %request_id, %address, "No input values; skipping connector call");
            let node = self.store_rows(address, Vec::new()).await?;
            return Ok(Step::Finished(node.with_message("no input values")));
        }

        let context = NodeContext {
            privacy_request_id: request_id,
            address: address.clone(),
            collection: self.graph.node(address).and_then(|node| node.collection.clone()),
            connection,
        };
        Ok(Step::Spawn(retrieve_task(
            connector,
            context,
            input,
            self.orchestrator.config.execution.retry.clone(),
            self.orchestrator.log_store.clone(),
        )))
    }

    async fn finish(&mut self, address: &CollectionAddress, rows: Vec<Row>) -> Result<NodeOutcome, OrchestrationError> {
        self.store_rows(address, rows).await
    }
}

struct ErasureRunner<'a> {
    orchestrator: &'a GraphOrchestrator,
    request: &'a PrivacyRequest,
    graph: &'a DatasetGraph,
    access: &'a BTreeMap<CollectionAddress, NodeOutcome>,
    rows: &'a BTreeMap<CollectionAddress, Vec<Row>>,
}

#[async_trait]
impl<'a> PhaseRunner for ErasureRunner<'a> {
    type Output = usize;

    fn action(&self) -> ActionType {
        ActionType::Erasure
    }

    async fn prepare(&mut self, address: &CollectionAddress) -> Result<Step<usize>, OrchestrationError> {
        let request_id = self.request.id.clone();
        let previous = self
            .orchestrator
            .log_store
            .latest_status(&request_id, ActionType::Erasure, &address.to_string())
            .await?;
        if previous == Some(ExecutionLogStatus::Complete) {
            return Ok(Step::Resumed(NodeOutcome::complete(0).with_message("resumed")));
        }

        let accessed = self.access.get(address).map(|node| node.status) == Some(ExecutionLogStatus::Complete);
        let Some(rows) = self.rows.get(address).filter(|_| accessed) else {
            return Ok(Step::Finished(NodeOutcome::skipped("access did not complete")));
        };

        let (connection, connector) = match self.orchestrator.resolve_connection(self.graph, address).await {
            Ok(found) => found,
            Err(node) => return Ok(Step::Finished(node)),
        };

        let Some(collection) = self.graph.node(address).and_then(|node| node.collection.clone()) else {
            return Ok(Step::Finished(NodeOutcome::complete(0).with_message("no collection schema")));
        };

        let masked = match mask_rows(
            &self.request.policy,
            &collection,
            rows,
            &self.orchestrator.masking,
            &request_id,
        ) {
            Ok(masked) => masked,
            Err(e) => return Ok(Step::Finished(NodeOutcome::error(e.to_string()))),
        };
        if masked.is_empty() {
            return Ok(Step::Finished(NodeOutcome::complete(0).with_message("nothing to mask")));
        }

        let context = NodeContext {
            privacy_request_id: request_id,
            address: address.clone(),
            collection: Some(collection),
            connection,
        };
        Ok(Step::Spawn(mask_task(
            connector,
            context,
            masked,
            self.orchestrator.config.execution.retry.clone(),
            self.orchestrator.log_store.clone(),
        )))
    }

    async fn finish(&mut self, _address: &CollectionAddress, updated: usize) -> Result<NodeOutcome, OrchestrationError> {
        Ok(NodeOutcome::complete(updated))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// NODE TASKS
// ──────────────────────────────────────────────────────────────────────────────

fn identity_row(identity: &Identity) -> Row {
    identity
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

async fn log_retry(store: &dyn ExecutionLogStore, context: &NodeContext, action: ActionType, attempt: u32) {
    let log = ExecutionLog::new(
        &context.privacy_request_id,
        context.address.to_string(),
        action,
        ExecutionLogStatus::Retrying,
        Some(format!("attempt {}", attempt)),
    );
    if let Err(e) = store.write_log(log).await {
        warn!(address = %context.address, "Failed to record retry: {}", e);
    }
}

fn retrieve_task(
    connector: Arc<dyn Connector>,
    context: NodeContext,
    input: NodeInput,
    retry: RetryConfig,
    log_store: Arc<dyn ExecutionLogStore>,
) -> BoxFuture<'static, Result<Vec<Row>, ConnectorError>> {
    async move {
        let (connector, context, input, log_store) = (&connector, &context, &input, &log_store);
        with_retries(&retry, "retrieve_data", move |attempt| async move {
            if attempt > 1 {
                log_retry(log_store.as_ref(), context, ActionType::Access, attempt).await;
            }
            connector.retrieve_data(context, input).await
        })
        .await
    }
    .boxed()
}

fn mask_task(
    connector: Arc<dyn Connector>,
    context: NodeContext,
    rows: Vec<Row>,
    retry: RetryConfig,
    log_store: Arc<dyn ExecutionLogStore>,
) -> BoxFuture<'static, Result<usize, ConnectorError>> {
    async move {
        let (connector, context, rows, log_store) = (&connector, &context, &rows, &log_store);
        with_retries(&retry, "mask_data", move |attempt| async move {
            if attempt > 1 {
                log_retry(log_store.as_ref(), context, ActionType::Erasure, attempt).await;
            }
            connector.mask_data(context, rows).await
        })
        .await
    }
    .boxed()
}

/// Rows with every erasure-targeted field masked, including values nested in arrays.
/// Primary keys are never masked so the connector can find the rows again. Only rows
/// where at least one value was replaced are returned.
fn mask_rows(
    policy: &Policy,
    collection: &Collection,
    rows: &[Row],
    masking: &MaskingStrategyRegistry,
    request_id: &str,
) -> Result<Vec<Row>, MaskingError> {
    let default_strategy = [MaskingSpec::new("null_rewrite", Value::Null)];
    let targets: Vec<_> = collection
        .fields
        .iter()
        .filter(|field| !field.primary_key)
        .filter_map(|field| policy.erasure_rule_for(field).map(|rule| (field, rule)))
        .collect();
    if targets.is_empty() || rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut masked = rows.to_vec();
    let mut touched = vec![false; masked.len()];
    for (field, rule) in targets {
        let specs = if rule.masking_strategy.is_empty() {
            &default_strategy[..]
        } else {
            &rule.masking_strategy[..]
        };
        for (row, touched) in masked.iter_mut().zip(touched.iter_mut()) {
            let slots = values_at_mut(row, &field.name);
            if slots.is_empty() {
                continue;
            }
            let values: Vec<Value> = slots.iter().map(|slot| (**slot).clone()).collect();
            let replaced = masking.mask_values(&values, specs, Some(request_id))?;
            for (slot, value) in slots.into_iter().zip(replaced) {
                *slot = value;
            }
            *touched = true;
        }
    }

    Ok(masked
        .into_iter()
        .zip(touched)
        .filter_map(|(row, touched)| touched.then_some(row))
        .collect())
}
