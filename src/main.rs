//! Privacy engine CLI
//!
//! - `format <map.json>`: print the field-level dependency map of a traversal map
//! - `plan <map.json> [identity.json]`: print the execution order, node dependencies
//!   and unreachable collections for a seed identity
//! - `access <map.json> <identity.json> <db.sqlite>`: run an access request with every
//!   dataset served by one SQLite database, printing the request outcome

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use privacy_engine::execution::{ConnectionConfig, ConnectorRegistry, SqliteConnector};
use privacy_engine::graph::{format_traversal_map, DatasetGraph, Traversal, TraversalMap};
use privacy_engine::policy::{ActionType, Policy, Rule};
use privacy_engine::{CancellationFlag, EngineConfig, GraphOrchestrator, Identity, PrivacyRequest};

const USAGE: &str = "usage: privacy_engine [--config <engine.yaml>] <format <map.json> | plan <map.json> [identity.json] | access <map.json> <identity.json> <db.sqlite>>";
const SQLITE_CONNECTION: &str = "sqlite";

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 >= args.len() {
            anyhow::bail!("--config needs a path\n{}", USAGE);
        }
        config_path = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    let config = EngineConfig::load(config_path.as_deref())?;

    // Initialize logging
    let filter = EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("privacy_engine=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    match args.as_slice() {
        [command, map] if command == "format" => {
            let map: TraversalMap = read_json(Path::new(map))?;
            let formatted = format_traversal_map(&map)?;
            println!("{}", serde_json::to_string_pretty(&formatted)?);
        }
        [command, map, rest @ ..] if command == "plan" && rest.len() <= 1 => {
            let map: TraversalMap = read_json(Path::new(map))?;
            let identity: Identity = match rest.first() {
                Some(path) => read_json(Path::new(path))?,
                None => Identity::new(),
            };

            let graph = DatasetGraph::from_traversal_map(map);
            info!(collections = graph.len(), "Planning traversal");
            let traversal = Traversal::new(&graph, &identity)?;
            let plan = json!({
                "order": traversal.order(),
                "erasure_order": traversal.erasure_order(),
                "dependencies": traversal.nodes(),
                "unreachable": traversal.unreachable(),
            });
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        [command, map, identity, db] if command == "access" => {
            let map: TraversalMap = read_json(Path::new(map))?;
            let identity: Identity = read_json(Path::new(identity))?;
            let datasets: BTreeSet<String> = map.keys().map(|address| address.dataset.clone()).collect();
            let graph = datasets
                .into_iter()
                .fold(DatasetGraph::from_traversal_map(map), |graph, dataset| {
                    graph.bind_dataset(dataset, SQLITE_CONNECTION)
                });

            let registry = Arc::new(ConnectorRegistry::new());
            registry
                .register(
                    ConnectionConfig::new(SQLITE_CONNECTION, SqliteConnector::TYPE),
                    Arc::new(SqliteConnector::new(db)),
                )
                .await;
            let orchestrator = GraphOrchestrator::from_config(config, registry).await?;

            let policy = Policy::new("cli_access", vec![Rule::new("access", ActionType::Access).with_target("user")]);
            let mut request = PrivacyRequest::new(policy, identity);
            info!(privacy_request_id = %request.id, collections = graph.len(), "Running access request");
            let outcome = orchestrator
                .run_privacy_request(&mut request, &graph, &CancellationFlag::new())
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        _ => anyhow::bail!(USAGE),
    }

    Ok(())
}
