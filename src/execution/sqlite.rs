//! Connector over a SQLite database file
//!
//! Each collection is a table of the same name and each top-level row field is a
//! column. Nested objects and arrays are stored as JSON text and decoded on read.

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::debug;

use super::connector::{Connector, NodeContext, NodeInput, Row};
use super::input::collect_values;
use crate::error::ConnectorError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    db_path: PathBuf,
}

impl SqliteConnector {
    pub const TYPE: &'static str = "sqlite";

    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn open(path: &Path) -> Result<Connection, ConnectorError> {
        let conn = Connection::open(path).map_err(connector_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(connector_error)?;
        Ok(conn)
    }
}

fn connector_error(e: rusqlite::Error) -> ConnectorError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            ConnectorError::Transient(e.to_string())
        }
        _ => ConnectorError::Fatal(e.to_string()),
    }
}

fn join_error(e: task::JoinError) -> ConnectorError {
    ConnectorError::Fatal(format!("sqlite task failed: {}", e))
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if text.starts_with('{') || text.starts_with('[') {
                if let Ok(nested) = serde_json::from_str::<Value>(&text) {
                    return nested;
                }
            }
            Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// `WHERE` clause matching any candidate of any top-level input field, with its
/// parameters. `None` when some input field is nested and rows must be filtered after
/// reading.
fn where_clause(input: &NodeInput) -> Option<(String, Vec<SqlValue>)> {
    if input.keys().any(|field| field.contains('.')) {
        return None;
    }
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for (field, candidates) in input.iter().filter(|(_, candidates)| !candidates.is_empty()) {
        let placeholders = vec!["?"; candidates.len()].join(", ");
        clauses.push(format!("{} IN ({})", quote(field), placeholders));
        params.extend(candidates.iter().map(to_sql));
    }
    Some((clauses.join(" OR "), params))
}

fn matches_input(row: &Row, input: &NodeInput) -> bool {
    input.iter().any(|(field, candidates)| {
        collect_values(row, field)
            .iter()
            .any(|value| candidates.contains(value))
    })
}

fn select_rows(conn: &Connection, table: &str, input: &NodeInput) -> Result<Vec<Row>, rusqlite::Error> {
    let (sql, params, filter_after) = match where_clause(input) {
        Some((clause, _)) if clause.is_empty() => return Ok(Vec::new()),
        Some((clause, params)) => (format!("SELECT * FROM {} WHERE {}", quote(table), clause), params, false),
        None => (format!("SELECT * FROM {}", quote(table)), Vec::new(), true),
    };

    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        let mut out = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            out.insert(name.clone(), from_sql(row.get_ref(idx)?));
        }
        Ok::<Row, rusqlite::Error>(out)
    })?;

    let mut found = Vec::new();
    for row in rows {
        let row = row?;
        if !filter_after || matches_input(&row, input) {
            found.push(row);
        }
    }
    Ok(found)
}

fn update_rows(
    conn: &mut Connection,
    table: &str,
    primary_keys: &[String],
    columns: &[String],
    rows: &[Row],
) -> Result<usize, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut updated = 0;
    for row in rows {
        let set: Vec<&String> = columns.iter().filter(|column| row.contains_key(column.as_str())).collect();
        if set.is_empty() {
            continue;
        }
        let assignments: Vec<String> = set.iter().map(|column| format!("{} = ?", quote(column))).collect();
        let conditions: Vec<String> = primary_keys.iter().map(|pk| format!("{} = ?", quote(pk))).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote(table),
            assignments.join(", "),
            conditions.join(" AND ")
        );

        let params: Vec<SqlValue> = set
            .iter()
            .map(|column| to_sql(&row[column.as_str()]))
            .chain(primary_keys.iter().map(|pk| to_sql(row.get(pk).unwrap_or(&Value::Null))))
            .collect();
        updated += tx.execute(&sql, params_from_iter(params.iter()))?;
    }
    tx.commit()?;
    Ok(updated)
}

#[async_trait]
impl Connector for SqliteConnector {
    fn connector_type(&self) -> &str {
        Self::TYPE
    }

    async fn retrieve_data(&self, context: &NodeContext, input: &NodeInput) -> Result<Vec<Row>, ConnectorError> {
        let path = self.db_path.clone();
        let table = context.address.collection.clone();
        let input = input.clone();

        let rows = task::spawn_blocking(move || {
            let conn = Self::open(&path)?;
            select_rows(&conn, &table, &input).map_err(connector_error)
        })
        .await
        .map_err(join_error)??;
        debug!(address = %context.address, rows = rows.len(), "Retrieved rows from sqlite");
        Ok(rows)
    }

    async fn mask_data(&self, context: &NodeContext, rows: &[Row]) -> Result<usize, ConnectorError> {
        let Some(collection) = context.collection.as_ref() else {
            return Err(ConnectorError::Fatal(format!("{} has no collection schema", context.address)));
        };
        let primary_keys: Vec<String> = collection.primary_keys().map(|f| f.name.clone()).collect();
        if primary_keys.is_empty() || primary_keys.iter().any(|pk| pk.contains('.')) {
            return Err(ConnectorError::Fatal(format!(
                "{} has no top-level primary key to update rows by",
                context.address
            )));
        }
        // Nested fields are rewritten through their top-level column.
        let columns: Vec<String> = collection
            .fields
            .iter()
            .filter(|field| !field.primary_key)
            .filter_map(|field| field.name.split('.').next())
            .filter(|column| !primary_keys.iter().any(|pk| pk == column))
            .map(String::from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let path = self.db_path.clone();
        let table = context.address.collection.clone();
        let rows = rows.to_vec();
        let updated = task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            update_rows(&mut conn, &table, &primary_keys, &columns, &rows).map_err(connector_error)
        })
        .await
        .map_err(join_error)??;
        debug!(address = %context.address, updated, "Masked rows in sqlite");
        Ok(updated)
    }
}
