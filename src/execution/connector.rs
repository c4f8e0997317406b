//! Connector capability interface and registry
//!
//! Connectors are selected at runtime by connection key. Each one implements the
//! capabilities it supports; the defaults report `Unsupported`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::input::{collect_values, value_at};
use crate::consent::{ConsentAction, System};
use crate::error::ConnectorError;
use crate::graph::{Collection, CollectionAddress};
use crate::request::Identity;

/// One record returned by a connector.
pub type Row = serde_json::Map<String, Value>;

/// Field name -> candidate values the connector should match on.
pub type NodeInput = BTreeMap<String, Vec<Value>>;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub key: String,
    pub connector_type: String,
    /// The system this connection belongs to; `None` for an orphaned connection
    #[serde(default)]
    pub system: Option<System>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ConnectionConfig {
    pub fn new(key: impl Into<String>, connector_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            connector_type: connector_type.into(),
            system: None,
            enabled: true,
        }
    }

    pub fn with_system(mut self, system: System) -> Self {
        self.system = Some(system);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Key under which consent statuses are reported: the system's key, or the
    /// connection key for an orphaned connection.
    pub fn system_key(&self) -> &str {
        self.system
            .as_ref()
            .map(|system| system.fides_key.as_str())
            .unwrap_or(&self.key)
    }
}

/// Everything a connector needs to know about the node it is serving.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub privacy_request_id: String,
    pub address: CollectionAddress,
    pub collection: Option<Collection>,
    pub connection: ConnectionConfig,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> &str;

    /// Rows of `context.address` matching any of the candidate input values.
    async fn retrieve_data(&self, context: &NodeContext, input: &NodeInput) -> Result<Vec<Row>, ConnectorError>;

    /// Persist already-masked rows. Returns the number of rows updated.
    async fn mask_data(&self, _context: &NodeContext, _rows: &[Row]) -> Result<usize, ConnectorError> {
        Err(ConnectorError::Unsupported("erasure".to_string()))
    }

    fn supports_consent(&self) -> bool {
        false
    }

    async fn run_consent_request(
        &self,
        _connection: &ConnectionConfig,
        _action: ConsentAction,
        _identity: &Identity,
    ) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("consent propagation".to_string()))
    }

    /// Identities this connector propagates consent with, recorded on the relevant preferences.
    fn consent_identities(&self, _identity: &Identity) -> Identity {
        Identity::new()
    }
}

struct RegisteredConnection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

/// Connection key -> (configuration, connector)
#[derive(Default)]
pub struct ConnectorRegistry {
    connections: RwLock<HashMap<String, RegisteredConnection>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, config: ConnectionConfig, connector: Arc<dyn Connector>) {
        let mut connections = self.connections.write().await;
        tracing::debug!(connection_key = %config.key, connector_type = connector.connector_type(), "Registered connection");
        connections.insert(config.key.clone(), RegisteredConnection { config, connector });
    }

    pub async fn get(&self, key: &str) -> Option<(ConnectionConfig, Arc<dyn Connector>)> {
        let connections = self.connections.read().await;
        connections
            .get(key)
            .map(|entry| (entry.config.clone(), entry.connector.clone()))
    }

    pub async fn connection_keys(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut keys: Vec<String> = connections.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Enabled connections able to propagate consent, sorted by key.
    pub async fn consent_connections(&self) -> Vec<(ConnectionConfig, Arc<dyn Connector>)> {
        let connections = self.connections.read().await;
        let mut found: Vec<_> = connections
            .values()
            .filter(|entry| entry.config.enabled && entry.connector.supports_consent())
            .map(|entry| (entry.config.clone(), entry.connector.clone()))
            .collect();
        found.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        found
    }
}

#[derive(Default)]
struct MemoryState {
    /// collection name -> rows
    tables: HashMap<String, Vec<Row>>,
    retrieve_failures: HashMap<String, VecDeque<ConnectorError>>,
    mask_failures: HashMap<String, VecDeque<ConnectorError>>,
    consent_failures: VecDeque<ConnectorError>,
    retrieve_calls: Vec<String>,
    consent_calls: Vec<(String, ConsentAction)>,
}

/// A connector over in-process tables keyed by collection name.
///
/// Failures can be scripted per collection; they are returned in order before the
/// connector starts answering normally.
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
    consent: bool,
    consent_identity_fields: Vec<String>,
}

impl MemoryConnector {
    pub const TYPE: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, collection: &str, rows: Vec<Value>) -> Self {
        let rows = rows.into_iter().filter_map(|row| row.as_object().cloned()).collect();
        self.lock().tables.insert(collection.to_string(), rows);
        self
    }

    /// Accept consent requests, recording `identity_fields` as the identities used.
    pub fn with_consent(mut self, identity_fields: &[&str]) -> Self {
        self.consent = true;
        self.consent_identity_fields = identity_fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn fail_retrieve(self, collection: &str, error: ConnectorError, times: usize) -> Self {
        self.lock()
            .retrieve_failures
            .entry(collection.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn fail_mask(self, collection: &str, error: ConnectorError, times: usize) -> Self {
        self.lock()
            .mask_failures
            .entry(collection.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn fail_consent(self, error: ConnectorError, times: usize) -> Self {
        self.lock().consent_failures.extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn rows(&self, collection: &str) -> Vec<Row> {
        self.lock().tables.get(collection).cloned().unwrap_or_default()
    }

    /// Collection names in the order they were queried, failed attempts included.
    pub fn retrieve_calls(&self) -> Vec<String> {
        self.lock().retrieve_calls.clone()
    }

    pub fn consent_calls(&self) -> Vec<(String, ConsentAction)> {
        self.lock().consent_calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn matches_input(row: &Row, input: &NodeInput) -> bool {
    input.iter().any(|(field, candidates)| {
        collect_values(row, field)
            .iter()
            .any(|value| candidates.contains(value))
    })
}

#[async_trait]
impl Connector for MemoryConnector {
    fn connector_type(&self) -> &str {
        Self::TYPE
    }

    async fn retrieve_data(&self, context: &NodeContext, input: &NodeInput) -> Result<Vec<Row>, ConnectorError> {
        let mut state = self.lock();
        let collection = &context.address.collection;
        state.retrieve_calls.push(collection.clone());
        if let Some(error) = state
            .retrieve_failures
            .get_mut(collection)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        Ok(state
            .tables
            .get(collection)
            .map(|rows| rows.iter().filter(|row| matches_input(row, input)).cloned().collect())
            .unwrap_or_default())
    }

    async fn mask_data(&self, context: &NodeContext, rows: &[Row]) -> Result<usize, ConnectorError> {
        let primary_keys: Vec<String> = context
            .collection
            .as_ref()
            .map(|c| c.primary_keys().map(|f| f.name.clone()).collect())
            .unwrap_or_default();
        if primary_keys.is_empty() {
            return Err(ConnectorError::Fatal(format!(
                "{} has no primary key to update rows by",
                context.address
            )));
        }

        let mut state = self.lock();
        let collection = &context.address.collection;
        if let Some(error) = state.mask_failures.get_mut(collection).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let table = state.tables.entry(collection.clone()).or_default();
        let mut updated = 0;
        for masked in rows {
            let key: Vec<Option<&Value>> = primary_keys.iter().map(|pk| value_at(masked, pk)).collect();
            if let Some(stored) = table
                .iter_mut()
                .find(|stored| primary_keys.iter().map(|pk| value_at(stored, pk)).collect::<Vec<_>>() == key)
            {
                *stored = masked.clone();
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn supports_consent(&self) -> bool {
        self.consent
    }

    async fn run_consent_request(
        &self,
        connection: &ConnectionConfig,
        action: ConsentAction,
        _identity: &Identity,
    ) -> Result<(), ConnectorError> {
        let mut state = self.lock();
        state.consent_calls.push((connection.key.clone(), action));
        match state.consent_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn consent_identities(&self, identity: &Identity) -> Identity {
        identity
            .iter()
            .filter(|(key, _)| self.consent_identity_fields.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(collection: Option<Collection>) -> NodeContext {
        NodeContext {
            privacy_request_id: "pri_test".into(),
            address: CollectionAddress::new("db", "customer"),
            collection,
            connection: ConnectionConfig::new("postgres", MemoryConnector::TYPE),
        }
    }

    #[test]
    fn test_system_key_falls_back_to_connection_key() {
        let orphan = ConnectionConfig::new("mailchimp_transactional", "saas");
        assert_eq!(orphan.system_key(), "mailchimp_transactional");
        let owned = orphan.with_system(System::new("marketing_platform"));
        assert_eq!(owned.system_key(), "marketing_platform");
    }

    #[tokio::test]
    async fn test_memory_connector_matches_any_input_field() {
        let connector = MemoryConnector::new().with_table(
            "customer",
            vec![
                json!({"id": 1, "email": "jane@example.com", "phone": "555"}),
                json!({"id": 2, "email": "john@example.com", "phone": "556"}),
                json!({"id": 3, "email": "kim@example.com", "phone": "557"}),
            ],
        );
        let input = NodeInput::from([
            ("email".to_string(), vec![json!("jane@example.com")]),
            ("phone".to_string(), vec![json!("557")]),
        ]);

        let rows = connector.retrieve_data(&context(None), &input).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_scripted_failures_come_first() {
        let connector = MemoryConnector::new()
            .with_table("customer", vec![json!({"id": 1, "email": "jane@example.com"})])
            .fail_retrieve("customer", ConnectorError::Transient("timeout".into()), 1);
        let input = NodeInput::from([("email".to_string(), vec![json!("jane@example.com")])]);

        assert!(connector.retrieve_data(&context(None), &input).await.is_err());
        assert_eq!(connector.retrieve_data(&context(None), &input).await.unwrap().len(), 1);
        assert_eq!(connector.retrieve_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mask_data_updates_by_primary_key() {
        let connector = MemoryConnector::new().with_table(
            "customer",
            vec![json!({"id": 1, "name": "Jane"}), json!({"id": 2, "name": "John"})],
        );
        let schema = Collection::new(
            "customer",
            vec![crate::graph::Field::new("id").primary_key(), crate::graph::Field::new("name")],
        );
        let masked = vec![json!({"id": 2, "name": null}).as_object().cloned().unwrap()];

        assert_eq!(connector.mask_data(&context(Some(schema)), &masked).await.unwrap(), 1);
        assert_eq!(connector.rows("customer")[1]["name"], Value::Null);
        assert_eq!(connector.rows("customer")[0]["name"], json!("Jane"));

        assert!(matches!(
            connector.mask_data(&context(None), &masked).await,
            Err(ConnectorError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_lists_consent_connections_sorted() {
        let registry = ConnectorRegistry::new();
        registry
            .register(
                ConnectionConfig::new("zeta", "memory"),
                Arc::new(MemoryConnector::new().with_consent(&[])),
            )
            .await;
        registry
            .register(ConnectionConfig::new("alpha", "memory"), Arc::new(MemoryConnector::new().with_consent(&[])))
            .await;
        registry
            .register(ConnectionConfig::new("postgres", "memory"), Arc::new(MemoryConnector::new()))
            .await;
        registry
            .register(
                ConnectionConfig::new("disabled", "memory").disabled(),
                Arc::new(MemoryConnector::new().with_consent(&[])),
            )
            .await;

        let keys: Vec<String> = registry
            .consent_connections()
            .await
            .into_iter()
            .map(|(config, _)| config.key)
            .collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
        assert_eq!(registry.connection_keys().await.len(), 4);
        assert!(registry.get("postgres").await.is_some());
    }
}
