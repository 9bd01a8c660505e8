// ── Operational tree writer ──
//
// Layout under each node:
//   /<node-id>                         node record (connection, schema)
//   /<node-id>/<kind segment>/<key>    one device row

use hwvtep_api::{
    ConnectionInfo, DatabaseSchema, OperationalStore, Row, StorePath, StoreTransaction,
};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::CoreError;
use crate::model::{DeviceId, EntityKind, ModelKey, NodeId};

pub fn row_path(node: &NodeId, kind: EntityKind, key: &ModelKey) -> StorePath {
    node.store_path().child(kind.segment()).child(key.as_str())
}

pub fn write_node(
    tx: &mut dyn StoreTransaction,
    node: &NodeId,
    info: &ConnectionInfo,
    schema: &DatabaseSchema,
) {
    tx.merge(
        node.store_path(),
        json!({
            "node-id": node.as_str(),
            "connection-info": {
                "remote": info.remote.to_string(),
                "local": info.local.map(|a| a.to_string()),
            },
            "database": schema.name,
            "schema-version": schema.version,
        }),
    );
}

pub fn put_row(
    tx: &mut dyn StoreTransaction,
    node: &NodeId,
    kind: EntityKind,
    key: &ModelKey,
    id: &DeviceId,
    row: &Row,
) {
    let mut value = row.clone();
    value.insert("uuid".into(), Value::String(id.to_string()));
    tx.put(row_path(node, kind, key), Value::Object(value));
}

pub fn delete_row(tx: &mut dyn StoreTransaction, node: &NodeId, kind: EntityKind, key: &ModelKey) {
    tx.delete(row_path(node, kind, key));
}

/// Remove everything recorded for `node`.
pub async fn delete_node(store: &dyn OperationalStore, node: &NodeId) -> Result<(), CoreError> {
    let mut tx = store.begin();
    tx.delete(node.store_path());
    tx.commit().await?;
    debug!(node = %node, "operational records deleted");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hwvtep_api::MemoryStore;

    #[tokio::test]
    async fn rows_land_below_node_and_go_with_it() {
        let store = MemoryStore::new();
        let node = NodeId::from("hwvtep://10.0.0.1");
        let key = ModelKey::from("LS1/00:11:22:33:44:55");

        let mut tx = store.begin();
        put_row(
            tx.as_mut(),
            &node,
            EntityKind::RemoteUcastMac,
            &key,
            &"U7".into(),
            &Row::new(),
        );
        tx.commit().await.unwrap();

        let path = row_path(&node, EntityKind::RemoteUcastMac, &key);
        assert_eq!(
            path.segments(),
            ["hwvtep://10.0.0.1", "remote-ucast-macs", "LS1/00:11:22:33:44:55"]
        );
        let stored = store.read(&path).await.unwrap().unwrap();
        assert_eq!(stored["uuid"], "U7");

        delete_node(&store, &node).await.unwrap();
        assert!(store.is_empty().await);
    }
}
