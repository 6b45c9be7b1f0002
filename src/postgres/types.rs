use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::lsn::Lsn;

/// Column name to value; ordered by name so encoded output is stable.
pub type ColumnValues = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
}

/// One decoded row change or transaction boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub position: Lsn,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "ColumnValues::is_empty")]
    pub columns: ColumnValues,
    /// Old row image (update) or key/old row (delete), when the server sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ColumnValues>,
    /// Final commit position of the transaction, set on `begin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_position: Option<Lsn>,
    /// Server commit timestamp in unix milliseconds, set on boundaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,
}

impl ChangeEvent {
    pub fn begin(position: Lsn, xid: u32, commit_position: Lsn, ts_ms: i64) -> Self {
        Self {
            position,
            kind: ChangeKind::Begin,
            xid: Some(xid),
            schema: None,
            table: None,
            columns: ColumnValues::new(),
            old: None,
            commit_position: Some(commit_position),
            ts_ms: Some(ts_ms),
        }
    }

    pub fn commit(position: Lsn, xid: Option<u32>, ts_ms: i64) -> Self {
        Self {
            position,
            kind: ChangeKind::Commit,
            xid,
            schema: None,
            table: None,
            columns: ColumnValues::new(),
            old: None,
            commit_position: None,
            ts_ms: Some(ts_ms),
        }
    }

    pub fn row(
        position: Lsn,
        kind: ChangeKind,
        xid: Option<u32>,
        schema: &str,
        table: &str,
        columns: ColumnValues,
        old: Option<ColumnValues>,
    ) -> Self {
        Self {
            position,
            kind,
            xid,
            schema: Some(schema.to_string()),
            table: Some(table.to_string()),
            columns,
            old,
            commit_position: None,
            ts_ms: None,
        }
    }

    /// `schema.table` for row events.
    pub fn qualified_table(&self) -> Option<String> {
        match (&self.schema, &self.table) {
            (Some(schema), Some(table)) => Some(format!("{}.{}", schema, table)),
            (None, Some(table)) => Some(table.clone()),
            _ => None,
        }
    }
}
