// ── Transaction commands ──
//
// Outbound writes are described in controller terms (kind + model key).
// The session turns them into wire operations at submission time, when
// device ids of referenced rows are known.

use hwvtep_api::Row;

use super::{EntityKind, ModelKey};

/// A column whose value is a reference to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub column: String,
    pub kind: EntityKind,
    pub key: ModelKey,
}

impl Reference {
    pub fn new(column: impl Into<String>, kind: EntityKind, key: ModelKey) -> Self {
        Self {
            column: column.into(),
            kind,
            key,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowAction {
    /// Create the row, or update it when the device already has it.
    Upsert {
        payload: Row,
        references: Vec<Reference>,
    },
    Delete,
}

/// Write intent for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOp {
    pub kind: EntityKind,
    pub key: ModelKey,
    pub action: RowAction,
}

impl RowOp {
    pub fn upsert(kind: EntityKind, key: ModelKey, payload: Row, references: Vec<Reference>) -> Self {
        Self {
            kind,
            key,
            action: RowAction::Upsert {
                payload,
                references,
            },
        }
    }

    pub fn delete(kind: EntityKind, key: ModelKey) -> Self {
        Self {
            kind,
            key,
            action: RowAction::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.action, RowAction::Delete)
    }
}

/// One device transaction. Operations are applied atomically, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactCommand {
    pub ops: Vec<RowOp>,
}

impl TransactCommand {
    pub fn new(ops: Vec<RowOp>) -> Self {
        Self { ops }
    }

    pub fn single(op: RowOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Short label for logs: `logical-switch LS1 (+1 more)`.
    pub fn label(&self) -> String {
        match self.ops.as_slice() {
            [] => "empty".into(),
            [op] => format!("{} {}", op.kind, op.key),
            [op, rest @ ..] => format!("{} {} (+{} more)", op.kind, op.key, rest.len()),
        }
    }
}
