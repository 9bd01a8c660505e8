// ── Domain model ──
//
// Identity types, entity kinds, cached rows, outbound commands and the
// desired-configuration feed.

pub mod change;
pub mod command;
pub mod key;
pub mod kind;
pub mod row;

pub use change::{ConfigChange, DesiredEntity, VXLAN_OVER_IPV4};
pub use command::{Reference, RowAction, RowOp, TransactCommand};
pub use key::{ConfigKey, DeviceId, ModelKey, NodeId};
pub use kind::EntityKind;
pub use row::{DeviceRow, RowStatus};
