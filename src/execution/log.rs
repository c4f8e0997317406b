//! Execution logs and the stores that persist them
//!
//! Every node transition writes one log row. The latest row per
//! (request, action, address) is what a restarted request resumes from; access rows
//! are cached next to the logs so downstream collections can be fed again.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tokio::task;
use uuid::Uuid;

use super::connector::Row;
use crate::policy::ActionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    Pending,
    InProcessing,
    Retrying,
    Complete,
    Error,
    Skipped,
}

impl ExecutionLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionLogStatus::Pending => "pending",
            ExecutionLogStatus::InProcessing => "in_processing",
            ExecutionLogStatus::Retrying => "retrying",
            ExecutionLogStatus::Complete => "complete",
            ExecutionLogStatus::Error => "error",
            ExecutionLogStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionLogStatus::Complete | ExecutionLogStatus::Error | ExecutionLogStatus::Skipped
        )
    }
}

impl fmt::Display for ExecutionLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionLogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => ExecutionLogStatus::Pending,
            "in_processing" => ExecutionLogStatus::InProcessing,
            "retrying" => ExecutionLogStatus::Retrying,
            "complete" => ExecutionLogStatus::Complete,
            "error" => ExecutionLogStatus::Error,
            "skipped" => ExecutionLogStatus::Skipped,
            other => anyhow::bail!("unknown execution log status `{}`", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub privacy_request_id: String,
    /// `dataset:collection` for graph nodes, the connection key for consent propagation
    pub address: String,
    pub action_type: ActionType,
    pub status: ExecutionLogStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(
        privacy_request_id: &str,
        address: impl Into<String>,
        action_type: ActionType,
        status: ExecutionLogStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            privacy_request_id: privacy_request_id.to_string(),
            address: address.into(),
            action_type,
            status,
            message,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn write_log(&self, log: ExecutionLog) -> Result<()>;
    async fn logs_for_request(&self, privacy_request_id: &str) -> Result<Vec<ExecutionLog>>;
    async fn latest_status(
        &self,
        privacy_request_id: &str,
        action_type: ActionType,
        address: &str,
    ) -> Result<Option<ExecutionLogStatus>>;
    async fn cache_access_rows(&self, privacy_request_id: &str, address: &str, rows: &[Row]) -> Result<()>;
    async fn cached_access_rows(&self, privacy_request_id: &str, address: &str) -> Result<Option<Vec<Row>>>;
}

#[derive(Default)]
struct MemoryState {
    logs: Vec<ExecutionLog>,
    rows: HashMap<(String, String), Vec<Row>>,
}

/// Process-local store, for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryExecutionLogStore {
    state: Mutex<MemoryState>,
}

impl MemoryExecutionLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLogStore for MemoryExecutionLogStore {
    async fn write_log(&self, log: ExecutionLog) -> Result<()> {
        self.state.lock().await.logs.push(log);
        Ok(())
    }

    async fn logs_for_request(&self, privacy_request_id: &str) -> Result<Vec<ExecutionLog>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|log| log.privacy_request_id == privacy_request_id)
            .cloned()
            .collect())
    }

    async fn latest_status(
        &self,
        privacy_request_id: &str,
        action_type: ActionType,
        address: &str,
    ) -> Result<Option<ExecutionLogStatus>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .rev()
            .find(|log| {
                log.privacy_request_id == privacy_request_id
                    && log.action_type == action_type
                    && log.address == address
            })
            .map(|log| log.status))
    }

    async fn cache_access_rows(&self, privacy_request_id: &str, address: &str, rows: &[Row]) -> Result<()> {
        self.state
            .lock()
            .await
            .rows
            .insert((privacy_request_id.to_string(), address.to_string()), rows.to_vec());
        Ok(())
    }

    async fn cached_access_rows(&self, privacy_request_id: &str, address: &str) -> Result<Option<Vec<Row>>> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(&(privacy_request_id.to_string(), address.to_string()))
            .cloned())
    }
}

/// SQLite-backed store. Each call opens its own connection on the blocking pool.
#[derive(Clone)]
pub struct SqliteExecutionLogStore {
    db_path: PathBuf,
}

impl SqliteExecutionLogStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS execution_logs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    privacy_request_id TEXT NOT NULL,
                    address TEXT NOT NULL,
                    action_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT,
                    created_at TEXT NOT NULL
                );
                "#,
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_logs_request ON execution_logs(privacy_request_id, action_type, address);",
                [],
            )?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS access_rows (
                    privacy_request_id TEXT NOT NULL,
                    address TEXT NOT NULL,
                    rows_json TEXT NOT NULL,
                    PRIMARY KEY (privacy_request_id, address)
                );
                "#,
                [],
            )?;

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }
}

type LogRow = (String, String, String, String, String, Option<String>, String);

fn log_from_row(row: LogRow) -> Result<ExecutionLog> {
    let (id, privacy_request_id, address, action_type, status, message, created_at) = row;
    Ok(ExecutionLog {
        id,
        privacy_request_id,
        address,
        action_type: serde_json::from_value(serde_json::Value::String(action_type))?,
        status: status.parse()?,
        message,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[async_trait]
impl ExecutionLogStore for SqliteExecutionLogStore {
    async fn write_log(&self, log: ExecutionLog) -> Result<()> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO execution_logs (id, privacy_request_id, address, action_type, status, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &log.id,
                    &log.privacy_request_id,
                    &log.address,
                    log.action_type.as_str(),
                    log.status.as_str(),
                    &log.message,
                    log.created_at.to_rfc3339(),
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn logs_for_request(&self, privacy_request_id: &str) -> Result<Vec<ExecutionLog>> {
        let path = self.db_path.clone();
        let request_id = privacy_request_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, privacy_request_id, address, action_type, status, message, created_at
                 FROM execution_logs
                 WHERE privacy_request_id = ?1
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![&request_id], |row| {
                Ok::<LogRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?;

            let mut logs = Vec::new();
            for row in rows {
                logs.push(log_from_row(row?)?);
            }
            Ok::<_, anyhow::Error>(logs)
        })
        .await?
    }

    async fn latest_status(
        &self,
        privacy_request_id: &str,
        action_type: ActionType,
        address: &str,
    ) -> Result<Option<ExecutionLogStatus>> {
        let path = self.db_path.clone();
        let request_id = privacy_request_id.to_string();
        let address = address.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM execution_logs
                     WHERE privacy_request_id = ?1 AND action_type = ?2 AND address = ?3
                     ORDER BY seq DESC
                     LIMIT 1",
                    params![&request_id, action_type.as_str(), &address],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<_, anyhow::Error>(status.map(|s| s.parse::<ExecutionLogStatus>()).transpose()?)
        })
        .await?
    }

    async fn cache_access_rows(&self, privacy_request_id: &str, address: &str, rows: &[Row]) -> Result<()> {
        let path = self.db_path.clone();
        let request_id = privacy_request_id.to_string();
        let address = address.to_string();
        let rows_json = serde_json::to_string(rows)?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT OR REPLACE INTO access_rows (privacy_request_id, address, rows_json) VALUES (?1, ?2, ?3)",
                params![&request_id, &address, &rows_json],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn cached_access_rows(&self, privacy_request_id: &str, address: &str) -> Result<Option<Vec<Row>>> {
        let path = self.db_path.clone();
        let request_id = privacy_request_id.to_string();
        let address = address.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let rows_json: Option<String> = conn
                .query_row(
                    "SELECT rows_json FROM access_rows WHERE privacy_request_id = ?1 AND address = ?2",
                    params![&request_id, &address],
                    |row| row.get(0),
                )
                .optional()?;
            let rows = match rows_json {
                Some(json) => Some(serde_json::from_str::<Vec<Row>>(&json)?),
                None => None,
            };
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }
}
