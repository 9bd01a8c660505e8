// ── OVSDB-style wire values ──
//
// Rows, operations, operation results and pushed table updates exactly as
// they travel between controller and device. Column values stay as
// `serde_json::Value` so schema versions the core does not know about pass
// through untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A device row: column name -> column value.
pub type Row = serde_json::Map<String, Value>;

// ── Value helpers ───────────────────────────────────────────────────

/// Encode a device uuid reference (`["uuid", "<id>"]`).
pub fn uuid_value(uuid: &str) -> Value {
    json!(["uuid", uuid])
}

/// Encode a reference to a row inserted earlier in the same transaction.
pub fn named_uuid_value(name: &str) -> Value {
    json!(["named-uuid", name])
}

/// Decode a `["uuid", "<id>"]` reference.
pub fn uuid_ref(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [tag, id] if tag.as_str() == Some("uuid") => id.as_str(),
        _ => None,
    }
}

/// Members of an OVSDB set. A scalar is a set of one; `["set", []]` is empty.
pub fn set_members(value: &Value) -> Vec<&Value> {
    if let Some([tag, items]) = value.as_array().map(Vec::as_slice) {
        if tag.as_str() == Some("set") {
            return items.as_array().map(|v| v.iter().collect()).unwrap_or_default();
        }
    }
    vec![value]
}

/// Read a plain string column.
pub fn string_column<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column)?.as_str()
}

// ── Operations ──────────────────────────────────────────────────────

/// A `where` clause term: `[column, function, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition(pub String, pub String, pub Value);

impl Condition {
    /// Match a single row by its device uuid.
    pub fn uuid_eq(uuid: &str) -> Self {
        Self("_uuid".into(), "==".into(), uuid_value(uuid))
    }
}

/// One operation of a device transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        table: String,
        row: Row,
        #[serde(rename = "uuid-name", skip_serializing_if = "Option::is_none")]
        uuid_name: Option<String>,
    },
    Update {
        table: String,
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
        row: Row,
    },
    Delete {
        table: String,
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
    },
}

impl Operation {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }
}

/// Result of one operation, positionally matched to the submitted list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl OperationResult {
    /// Device uuid assigned by an insert.
    pub fn inserted_uuid(&self) -> Option<&str> {
        self.uuid.as_ref().and_then(uuid_ref)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Monitoring ──────────────────────────────────────────────────────

/// Subscribe to a table, limited to the listed columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub table: String,
    pub columns: Vec<String>,
}

/// Change to a single row. `old` without `new` is a delete, `new` without
/// `old` an insert, both a modification (`old` then carries only the
/// changed columns).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
}

impl RowUpdate {
    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}

/// Row changes for one table, keyed by device uuid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableUpdate {
    pub rows: BTreeMap<String, RowUpdate>,
}

/// A monitor push: table name -> row changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableUpdates {
    pub tables: BTreeMap<String, TableUpdate>,
}

impl TableUpdates {
    pub fn table(&self, name: &str) -> Option<&TableUpdate> {
        self.tables.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.rows.is_empty())
    }
}
