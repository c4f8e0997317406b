//! Node input construction
//!
//! Values flow along execution edges: for `P.f -> N.g` every value found under `f` in
//! P's rows becomes a candidate value of `g` when N is queried.

use serde_json::Value;
use std::collections::BTreeMap;

use super::connector::{NodeInput, Row};
use crate::graph::{CollectionAddress, Edge};

/// Every non-null value under a dotted `path`, with arrays flattened at any depth.
pub fn collect_values(row: &Row, path: &str) -> Vec<Value> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let mut current: Vec<&Value> = row.get(first).into_iter().collect();
    for segment in segments {
        current = current
            .into_iter()
            .flat_map(flatten)
            .filter_map(|value| value.as_object().and_then(|obj| obj.get(segment)))
            .collect();
    }

    current
        .into_iter()
        .flat_map(flatten)
        .filter(|value| !value.is_null())
        .cloned()
        .collect()
}

fn flatten(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

/// The value stored at `path`, without flattening arrays.
pub fn value_at<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = row.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Mutable references to every non-null leaf under a dotted `path`, walking into
/// arrays at every segment the same way [`collect_values`] reads them.
pub fn values_at_mut<'a>(row: &'a mut Row, path: &str) -> Vec<&'a mut Value> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let mut current: Vec<&mut Value> = row.get_mut(first).into_iter().collect();
    for segment in segments {
        current = current
            .into_iter()
            .flat_map(flatten_mut)
            .filter_map(|value| value.as_object_mut().and_then(|obj| obj.get_mut(segment)))
            .collect();
    }

    current
        .into_iter()
        .flat_map(flatten_mut)
        .filter(|value| !value.is_null())
        .collect()
}

fn flatten_mut(value: &mut Value) -> Vec<&mut Value> {
    match value {
        Value::Array(items) => items.iter_mut().flat_map(flatten_mut).collect(),
        other => vec![other],
    }
}

/// Build the input of one node from the rows its parents returned.
pub fn build_node_input(incoming: &[Edge], rows_by_address: &BTreeMap<CollectionAddress, Vec<Row>>) -> NodeInput {
    let mut input = NodeInput::new();
    for edge in incoming {
        let values = input.entry(edge.to.path.clone()).or_default();
        let Some(rows) = rows_by_address.get(&edge.from.collection) else {
            continue;
        };
        for row in rows {
            for value in collect_values(row, &edge.from.path) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
    }
    input
}

/// True when no field has a single candidate value.
pub fn is_empty_input(input: &NodeInput) -> bool {
    input.values().all(Vec::is_empty)
}
