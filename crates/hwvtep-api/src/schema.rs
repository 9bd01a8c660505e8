// ── Database schema ──
//
// Only the shape matters to the core: which tables and columns the device
// serves. Column types are ignored.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Schema of one device database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).is_some_and(|t| t.has_column(column))
    }
}

/// Columns served for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawTableSchema", into = "RawTableSchema")]
pub struct TableSchema {
    pub columns: BTreeSet<String>,
}

impl TableSchema {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }
}

/// On-the-wire table schema: `{"columns": {"<name>": {<type>}}}`.
#[derive(Serialize, Deserialize)]
struct RawTableSchema {
    #[serde(default)]
    columns: BTreeMap<String, serde_json::Value>,
}

impl From<RawTableSchema> for TableSchema {
    fn from(raw: RawTableSchema) -> Self {
        Self {
            columns: raw.columns.into_keys().collect(),
        }
    }
}

impl From<TableSchema> for RawTableSchema {
    fn from(schema: TableSchema) -> Self {
        Self {
            columns: schema
                .columns
                .into_iter()
                .map(|c| (c, serde_json::Value::Object(serde_json::Map::new())))
                .collect(),
        }
    }
}
