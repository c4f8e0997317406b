//! End-to-end orchestration over in-memory connectors.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use privacy_engine::config::{EngineConfig, RetryConfig};
use privacy_engine::error::{ConnectorError, GraphError, LeaseError, OrchestrationError};
use privacy_engine::execution::{
    CancellationFlag, ConnectionConfig, Connector, ConnectorRegistry, ExecutionLogStatus, ExecutionLogStore,
    GraphOrchestrator, MemoryConnector, MemoryExecutionLogStore, NodeContext, NodeInput, Row, SqliteConnector,
};
use privacy_engine::graph::{Collection, CollectionAddress, DatasetGraph, Field, TraversalMap};
use privacy_engine::policy::{ActionType, MaskingSpec, Policy, Rule};
use privacy_engine::request::{Identity, PrivacyRequest, RequestStatus};

// ──────────────────────────────────────────────────────────────────────────────
// FIXTURES
// ──────────────────────────────────────────────────────────────────────────────

fn addr(collection: &str) -> CollectionAddress {
    CollectionAddress::new("shop", collection)
}

fn shop_map() -> TraversalMap {
    serde_json::from_value(json!({
        "shop:customer": {
            "from": {"__ROOT__:__ROOT__": ["email -> email"]},
            "to": {
                "shop:orders": ["id -> customer_id"],
                "shop:login": ["id -> customer_id"]
            }
        },
        "shop:orders": {
            "from": {"shop:customer": ["id -> customer_id"]},
            "to": {"shop:order_item": ["id -> order_id"]}
        },
        "shop:order_item": {"from": {"shop:orders": ["id -> order_id"]}, "to": {}},
        "shop:login": {"from": {"shop:customer": ["id -> customer_id"]}, "to": {}}
    }))
    .unwrap()
}

fn shop_graph() -> DatasetGraph {
    DatasetGraph::from_traversal_map(shop_map())
        .with_collection(
            "shop",
            Collection::new(
                "customer",
                vec![
                    Field::new("id").primary_key(),
                    Field::new("email").with_category("user.contact.email"),
                    Field::new("name").with_category("user.name"),
                ],
            ),
        )
        .with_collection(
            "shop",
            Collection::new(
                "orders",
                vec![
                    Field::new("id").primary_key(),
                    Field::new("customer_id"),
                    Field::new("shipping.street").with_category("user.contact.address.street"),
                ],
            ),
        )
        .with_collection(
            "shop",
            Collection::new("order_item", vec![Field::new("id").primary_key(), Field::new("order_id")]),
        )
        .with_collection(
            "shop",
            Collection::new("login", vec![Field::new("id").primary_key(), Field::new("customer_id")]),
        )
        .bind_dataset("shop", "postgres")
}

fn shop_connector() -> MemoryConnector {
    MemoryConnector::new()
        .with_table(
            "customer",
            vec![
                json!({"id": 1, "email": "jane@example.com", "name": "Jane"}),
                json!({"id": 2, "email": "john@example.com", "name": "John"}),
            ],
        )
        .with_table(
            "orders",
            vec![
                json!({"id": 10, "customer_id": 1, "shipping": {"street": "1 Main St"}}),
                json!({"id": 11, "customer_id": 1, "shipping": {"street": "2 Side St"}}),
                json!({"id": 12, "customer_id": 2, "shipping": {"street": "3 Far Rd"}}),
            ],
        )
        .with_table(
            "order_item",
            vec![json!({"id": 100, "order_id": 10}), json!({"id": 101, "order_id": 12})],
        )
        .with_table("login", vec![json!({"id": 1000, "customer_id": 1})])
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.execution.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
    };
    config
}

fn access_policy() -> Policy {
    Policy::new("access", vec![Rule::new("access", ActionType::Access).with_target("user")])
}

fn erasure_policy() -> Policy {
    Policy::new(
        "erasure",
        vec![
            Rule::new("access", ActionType::Access).with_target("user"),
            Rule::new("erase_contact", ActionType::Erasure)
                .with_target("user.contact")
                .with_masking(MaskingSpec::new("string_rewrite", json!({"rewrite_value": "MASKED"}))),
        ],
    )
}

fn jane(policy: Policy) -> PrivacyRequest {
    PrivacyRequest::new(
        policy,
        Identity::from([("email".to_string(), json!("jane@example.com"))]),
    )
}

struct Harness {
    orchestrator: GraphOrchestrator,
    connector: Arc<MemoryConnector>,
    logs: Arc<MemoryExecutionLogStore>,
}

async fn harness_with(config: EngineConfig, connector: MemoryConnector) -> Harness {
    let connector = Arc::new(connector);
    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register(ConnectionConfig::new("postgres", MemoryConnector::TYPE), connector.clone())
        .await;
    let logs = Arc::new(MemoryExecutionLogStore::new());
    let orchestrator = GraphOrchestrator::new(Arc::new(config), registry, logs.clone());
    Harness {
        orchestrator,
        connector,
        logs,
    }
}

async fn harness(connector: MemoryConnector) -> Harness {
    harness_with(fast_config(), connector).await
}

fn ids(rows: &[Row]) -> Vec<Value> {
    rows.iter().map(|row| row["id"].clone()).collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// ACCESS
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_access_follows_edges_from_identity() {
    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(ids(&outcome.access_results[&addr("customer")]), vec![json!(1)]);
    assert_eq!(ids(&outcome.access_results[&addr("orders")]), vec![json!(10), json!(11)]);
    assert_eq!(ids(&outcome.access_results[&addr("order_item")]), vec![json!(100)]);
    assert_eq!(ids(&outcome.access_results[&addr("login")]), vec![json!(1000)]);
    assert!(!outcome.access_results.contains_key(&CollectionAddress::root()));
    assert!(outcome.erasure.is_empty());

    let logs = h.logs.logs_for_request(&request.id).await.unwrap();
    let customer: Vec<ExecutionLogStatus> = logs
        .iter()
        .filter(|log| log.address == "shop:customer")
        .map(|log| log.status)
        .collect();
    assert_eq!(customer, vec![ExecutionLogStatus::InProcessing, ExecutionLogStatus::Complete]);
    assert!(logs.iter().all(|log| log.address != "__ROOT__:__ROOT__"));
}

#[tokio::test]
async fn test_parents_complete_before_children_start() {
    let mut config = fast_config();
    config.execution.max_concurrency = 1;
    let h = harness_with(config, shop_connector()).await;
    let mut request = jane(access_policy());

    h.orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(h.connector.retrieve_calls(), vec!["customer", "login", "orders", "order_item"]);
}

/// Records how many retrievals overlap and the order they start and finish in.
#[derive(Default)]
struct OverlapConnector {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl OverlapConnector {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events().iter().position(|e| e == event).unwrap()
    }
}

#[async_trait]
impl Connector for OverlapConnector {
    fn connector_type(&self) -> &str {
        "overlap"
    }

    async fn retrieve_data(&self, context: &NodeContext, _input: &NodeInput) -> Result<Vec<Row>, ConnectorError> {
        let collection = context.address.collection.clone();
        self.events.lock().unwrap().push(format!("start {}", collection));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("finish {}", collection));
        Ok(vec![json!({"id": 1}).as_object().cloned().unwrap()])
    }
}

#[tokio::test]
async fn test_independent_nodes_run_concurrently_up_to_the_limit() {
    let map: TraversalMap = serde_json::from_value(json!({
        "shop:a": {"from": {"__ROOT__:__ROOT__": ["email -> email"]}, "to": {"shop:a_child": ["id -> a_id"]}},
        "shop:b": {"from": {"__ROOT__:__ROOT__": ["email -> email"]}, "to": {}},
        "shop:c": {"from": {"__ROOT__:__ROOT__": ["email -> email"]}, "to": {}},
        "shop:d": {"from": {"__ROOT__:__ROOT__": ["email -> email"]}, "to": {}},
        "shop:e": {"from": {"__ROOT__:__ROOT__": ["email -> email"]}, "to": {}},
        "shop:a_child": {"from": {"shop:a": ["id -> a_id"]}, "to": {}}
    }))
    .unwrap();
    let graph = DatasetGraph::from_traversal_map(map).bind_dataset("shop", "postgres");

    let connector = Arc::new(OverlapConnector::default());
    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register(ConnectionConfig::new("postgres", "overlap"), connector.clone())
        .await;
    let mut config = fast_config();
    config.execution.max_concurrency = 2;
    let orchestrator = GraphOrchestrator::new(
        Arc::new(config),
        registry,
        Arc::new(MemoryExecutionLogStore::new()),
    );
    let mut request = jane(access_policy());

    let outcome = orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(connector.events().len(), 12);
    assert_eq!(connector.peak.load(Ordering::SeqCst), 2);
    assert_eq!(connector.in_flight.load(Ordering::SeqCst), 0);
    assert!(connector.position("finish a") < connector.position("start a_child"));
}

#[tokio::test]
async fn test_failed_node_skips_dependents_but_not_siblings() {
    let connector = shop_connector().fail_retrieve("orders", ConnectorError::Fatal("permission denied".into()), 1);
    let h = harness(connector).await;
    let mut request = jane(access_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Error);
    assert_eq!(outcome.access[&addr("orders")].status, ExecutionLogStatus::Error);
    assert_eq!(
        outcome.access[&addr("orders")].message.as_deref(),
        Some("connector failure: permission denied")
    );
    assert_eq!(outcome.access[&addr("order_item")].status, ExecutionLogStatus::Skipped);
    assert_eq!(outcome.access[&addr("login")].status, ExecutionLogStatus::Complete);
    assert!(!h.connector.retrieve_calls().contains(&"order_item".to_string()));
    assert_eq!(outcome.errors().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let connector =
        shop_connector().fail_retrieve("customer", ConnectorError::Transient("connection reset".into()), 2);
    let h = harness(connector).await;
    let mut request = jane(access_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    let retries = h
        .logs
        .logs_for_request(&request.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|log| log.status == ExecutionLogStatus::Retrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_node() {
    let connector = shop_connector().fail_retrieve("login", ConnectorError::Transient("timeout".into()), 3);
    let h = harness(connector).await;
    let mut request = jane(access_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Error);
    let login = &outcome.access[&addr("login")];
    assert_eq!(login.status, ExecutionLogStatus::Error);
    assert_eq!(login.message.as_deref(), Some("gave up after 3 attempts: timeout"));
    assert_eq!(outcome.access[&addr("order_item")].status, ExecutionLogStatus::Complete);
}

#[tokio::test]
async fn test_node_without_input_values_is_not_queried() {
    let h = harness(shop_connector()).await;
    let mut request = PrivacyRequest::new(
        access_policy(),
        Identity::from([("email".to_string(), json!("nobody@example.com"))]),
    );

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(outcome.access[&addr("customer")].rows, 0);
    let orders = &outcome.access[&addr("orders")];
    assert_eq!(orders.status, ExecutionLogStatus::Complete);
    assert_eq!(orders.message.as_deref(), Some("no input values"));
    assert_eq!(h.connector.retrieve_calls(), vec!["customer"]);
}

#[tokio::test]
async fn test_unbound_dataset_fails_its_nodes() {
    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());
    let graph = DatasetGraph::from_traversal_map(shop_map());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Error);
    assert_eq!(
        outcome.access[&addr("customer")].message.as_deref(),
        Some("no connection configured for dataset shop")
    );
    assert_eq!(outcome.access[&addr("orders")].status, ExecutionLogStatus::Skipped);
}

// ──────────────────────────────────────────────────────────────────────────────
// ERASURE
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_erasure_masks_targeted_fields_in_reverse_order() {
    let h = harness(shop_connector()).await;
    let mut request = jane(erasure_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(outcome.rows_masked[&addr("customer")], 1);
    assert_eq!(outcome.rows_masked[&addr("orders")], 2);
    assert_eq!(outcome.rows_masked[&addr("order_item")], 0);

    let customers = h.connector.rows("customer");
    assert_eq!(customers[0]["email"], json!("MASKED"));
    // user.name is not targeted by the erasure rule
    assert_eq!(customers[0]["name"], json!("Jane"));
    assert_eq!(customers[0]["id"], json!(1));
    assert_eq!(customers[1]["email"], json!("john@example.com"));

    let orders = h.connector.rows("orders");
    assert_eq!(orders[0]["shipping"]["street"], json!("MASKED"));
    assert_eq!(orders[2]["shipping"]["street"], json!("3 Far Rd"));

    // Access results keep what was read before masking
    assert_eq!(outcome.access_results[&addr("customer")][0]["email"], json!("jane@example.com"));

    let erased: Vec<String> = h
        .logs
        .logs_for_request(&request.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|log| log.action_type == ActionType::Erasure && log.status == ExecutionLogStatus::Complete)
        .map(|log| log.address)
        .collect();
    let position = |name: &str| erased.iter().position(|a| a == name).unwrap();
    assert!(position("shop:order_item") < position("shop:orders"));
    assert!(position("shop:orders") < position("shop:customer"));
    assert!(position("shop:login") < position("shop:customer"));
}

#[tokio::test]
async fn test_erasure_skips_nodes_whose_access_failed() {
    let connector = shop_connector().fail_retrieve("login", ConnectorError::Fatal("schema mismatch".into()), 1);
    let h = harness(connector).await;
    let mut request = jane(erasure_policy());

    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Error);
    assert_eq!(outcome.erasure[&addr("login")].status, ExecutionLogStatus::Skipped);
    // customer waits on every collection reading its values
    assert_eq!(outcome.erasure[&addr("customer")].status, ExecutionLogStatus::Skipped);
    assert_eq!(outcome.erasure[&addr("orders")].status, ExecutionLogStatus::Complete);
    assert_eq!(h.connector.rows("customer")[0]["email"], json!("jane@example.com"));
}

#[tokio::test]
async fn test_unknown_masking_strategy_is_rejected_up_front() {
    let h = harness(shop_connector()).await;
    let mut request = jane(Policy::new(
        "bad",
        vec![Rule::new("erase", ActionType::Erasure)
            .with_target("user")
            .with_masking(MaskingSpec::new("aes_encrypt", json!({})))],
    ));

    let result = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await;
    assert!(matches!(result, Err(OrchestrationError::Masking(_))));
    assert!(h.connector.retrieve_calls().is_empty());
}

#[tokio::test]
async fn test_erasure_against_sqlite_database() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("shop.db");
    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch(
            r#"
            CREATE TABLE customer (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
            INSERT INTO customer VALUES (1, 'jane@example.com', 'Jane'), (2, 'john@example.com', 'John');
            CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, shipping TEXT);
            INSERT INTO orders VALUES
                (10, 1, '{"street":"1 Main St"}'),
                (11, 1, '{"street":"2 Side St"}'),
                (12, 2, '{"street":"3 Far Rd"}');
            CREATE TABLE order_item (id INTEGER PRIMARY KEY, order_id INTEGER);
            INSERT INTO order_item VALUES (100, 10), (101, 12);
            CREATE TABLE login (id INTEGER PRIMARY KEY, customer_id INTEGER);
            INSERT INTO login VALUES (1000, 1);
            "#,
        )
        .unwrap();

    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register(
            ConnectionConfig::new("postgres", SqliteConnector::TYPE),
            Arc::new(SqliteConnector::new(&db)),
        )
        .await;
    let orchestrator = GraphOrchestrator::new(
        Arc::new(fast_config()),
        registry,
        Arc::new(MemoryExecutionLogStore::new()),
    );
    let mut request = jane(erasure_policy());

    let outcome = orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(ids(&outcome.access_results[&addr("orders")]), vec![json!(10), json!(11)]);
    assert_eq!(ids(&outcome.access_results[&addr("order_item")]), vec![json!(100)]);
    assert_eq!(outcome.rows_masked[&addr("customer")], 1);
    assert_eq!(outcome.rows_masked[&addr("orders")], 2);

    let conn = rusqlite::Connection::open(&db).unwrap();
    let email = |id: i64| -> String {
        conn.query_row("SELECT email FROM customer WHERE id = ?1", [id], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(email(1), "MASKED");
    assert_eq!(email(2), "john@example.com");
    let shipping = |id: i64| -> String {
        conn.query_row("SELECT shipping FROM orders WHERE id = ?1", [id], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(serde_json::from_str::<Value>(&shipping(10)).unwrap(), json!({"street": "MASKED"}));
    assert_eq!(serde_json::from_str::<Value>(&shipping(12)).unwrap(), json!({"street": "3 Far Rd"}));
}

// ──────────────────────────────────────────────────────────────────────────────
// RESUME, LEASES, CANCELLATION
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restarted_request_skips_completed_nodes() {
    let connector = shop_connector().fail_retrieve("orders", ConnectorError::Fatal("database offline".into()), 1);
    let h = harness(connector).await;
    let mut request = jane(access_policy());
    let graph = shop_graph();

    let first = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(first.status, RequestStatus::Error);

    let second = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(second.status, RequestStatus::Complete);
    assert_eq!(second.access[&addr("customer")].message.as_deref(), Some("resumed"));
    assert_eq!(ids(&second.access_results[&addr("customer")]), vec![json!(1)]);
    assert_eq!(ids(&second.access_results[&addr("order_item")]), vec![json!(100)]);

    let calls = h.connector.retrieve_calls();
    assert_eq!(calls.iter().filter(|c| *c == "customer").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "login").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "orders").count(), 2);
}

#[tokio::test]
async fn test_same_request_cannot_run_twice_at_once() {
    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());

    let _held = h.orchestrator.leases().acquire(&request.id).unwrap();
    let result = h
        .orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await;

    assert!(matches!(result, Err(OrchestrationError::Lease(LeaseError::AlreadyHeld(_)))));
    assert!(h.connector.retrieve_calls().is_empty());
}

#[tokio::test]
async fn test_lease_is_released_after_run() {
    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());

    h.orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();
    assert!(!h.orchestrator.leases().is_held(&request.id));
}

/// Cancels the request while serving one collection.
struct CancellingConnector {
    inner: MemoryConnector,
    flag: CancellationFlag,
    cancel_on: String,
}

#[async_trait]
impl Connector for CancellingConnector {
    fn connector_type(&self) -> &str {
        "cancelling"
    }

    async fn retrieve_data(&self, context: &NodeContext, input: &NodeInput) -> Result<Vec<Row>, ConnectorError> {
        if context.address.collection == self.cancel_on {
            self.flag.cancel();
        }
        self.inner.retrieve_data(context, input).await
    }
}

#[tokio::test]
async fn test_cancellation_discards_in_flight_results() {
    let flag = CancellationFlag::new();
    let connector = Arc::new(CancellingConnector {
        inner: shop_connector(),
        flag: flag.clone(),
        cancel_on: "customer".into(),
    });
    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register(ConnectionConfig::new("postgres", "cancelling"), connector.clone())
        .await;
    let orchestrator = GraphOrchestrator::new(
        Arc::new(fast_config()),
        registry,
        Arc::new(MemoryExecutionLogStore::new()),
    );
    let mut request = jane(erasure_policy());

    let outcome = orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &flag)
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Canceled);
    assert_eq!(request.status, RequestStatus::Canceled);
    let customer = &outcome.access[&addr("customer")];
    assert_eq!(customer.status, ExecutionLogStatus::Error);
    assert_eq!(customer.message.as_deref(), Some("request cancelled"));
    assert!(outcome.access_results.get(&addr("customer")).is_none());
    for name in ["orders", "login", "order_item"] {
        assert_eq!(outcome.access[&addr(name)].status, ExecutionLogStatus::Skipped);
    }
    assert_eq!(connector.inner.retrieve_calls(), vec!["customer"]);
    assert!(outcome.erasure.is_empty());
}

// ──────────────────────────────────────────────────────────────────────────────
// PLANNING FAILURES
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cycle_aborts_before_any_connector_call() {
    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());
    let map: TraversalMap = serde_json::from_value(json!({
        "shop:customer": {
            "from": {"__ROOT__:__ROOT__": ["email -> email"], "shop:orders": ["customer_id -> id"]},
            "to": {"shop:orders": ["id -> customer_id"]}
        },
        "shop:orders": {"from": {}, "to": {}}
    }))
    .unwrap();
    let graph = DatasetGraph::from_traversal_map(map).bind_dataset("shop", "postgres");

    let result = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await;

    match result {
        Err(OrchestrationError::Graph(GraphError::Cycle { members })) => {
            assert_eq!(members, vec![addr("customer"), addr("orders")]);
        }
        other => panic!("expected a cycle error, got {:?}", other.map(|o| o.status)),
    }
    assert!(h.connector.retrieve_calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_collections_are_reported() {
    let mut map = shop_map();
    map.insert(addr("audit"), Default::default());
    let graph = DatasetGraph::from_traversal_map(map).bind_dataset("shop", "postgres");

    let h = harness(shop_connector()).await;
    let mut request = jane(access_policy());
    let outcome = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Complete);
    assert_eq!(outcome.unreachable.len(), 1);
    assert_eq!(outcome.unreachable[0].address, addr("audit"));
    assert!(!outcome.access.contains_key(&addr("audit")));

    let mut strict = fast_config();
    strict.execution.require_full_coverage = true;
    let h = harness_with(strict, shop_connector()).await;
    let mut request = jane(access_policy());
    let result = h
        .orchestrator
        .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
        .await;
    assert!(matches!(
        result,
        Err(OrchestrationError::Graph(GraphError::Unreachable { .. }))
    ));
}

#[tokio::test]
async fn test_sqlite_backed_orchestrator_persists_logs() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = fast_config();
    config.storage.sqlite_path = Some(dir.path().join("engine.db"));

    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register(ConnectionConfig::new("postgres", MemoryConnector::TYPE), Arc::new(shop_connector()))
        .await;
    let orchestrator = GraphOrchestrator::from_config(config, registry).await.unwrap();
    let mut request = jane(access_policy());

    let outcome = orchestrator
        .run_privacy_request(&mut request, &shop_graph(), &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Complete);

    let store = orchestrator.log_store();
    assert_eq!(
        store
            .latest_status(&request.id, ActionType::Access, "shop:order_item")
            .await
            .unwrap(),
        Some(ExecutionLogStatus::Complete)
    );
    let cached = store
        .cached_access_rows(&request.id, "shop:orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.len(), 2);
}
