// ── Diagnostic dumps ──
//
// Point-in-time, serializable snapshots of a session. Capturing a dump
// never mutates engine state.

use hwvtep_api::{ConnectionInfo, Row};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::EntityRef;
use crate::model::{DeviceId, EntityKind, ModelKey, NodeId, RowStatus};
use crate::queue::WaitQueue;
use crate::session::gate::GateOutcome;
use crate::session::history::HistoryEntry;
use crate::session::{ConnectionSession, Initiation, SessionState};

#[derive(Debug, Clone, Serialize)]
pub struct RowDump {
    pub kind: EntityKind,
    pub key: ModelKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_transit_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Row>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefCountDump {
    pub resource: EntityRef,
    pub holders: Vec<EntityRef>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepths {
    pub config: usize,
    pub oper: usize,
}

/// Everything the engine knows about one device.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDump {
    pub node: NodeId,
    pub session_id: Uuid,
    pub connection: ConnectionInfo,
    pub initiation: Initiation,
    pub state: SessionState,
    pub owner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateOutcome>,
    pub rows: Vec<RowDump>,
    pub config: Vec<EntityRef>,
    pub refcounts: Vec<RefCountDump>,
    pub queue: QueueDepths,
    pub controller_history: Vec<HistoryEntry>,
    pub device_history: Vec<HistoryEntry>,
}

impl SessionDump {
    pub(crate) fn capture(session: &ConnectionSession) -> Self {
        let cache = session.cache();
        let now = Instant::now();

        let rows = cache
            .entries()
            .into_iter()
            .map(|(kind, row)| RowDump {
                kind,
                key: row.key().clone(),
                device_id: row.device_id().cloned(),
                status: row.status(),
                in_transit_ms: row
                    .in_transit_age(now)
                    .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
                payload: row.payload().cloned(),
            })
            .collect();

        let config = cache
            .config_entries()
            .into_iter()
            .map(|(kind, key, _)| EntityRef::new(kind, key))
            .collect();

        let refcounts = cache
            .refs()
            .snapshot()
            .into_iter()
            .map(|(resource, holders)| RefCountDump { resource, holders })
            .collect();

        Self {
            node: session.node().clone(),
            session_id: session.id(),
            connection: session.connection_info(),
            initiation: session.initiation(),
            state: session.state(),
            owner: session.is_owner(),
            gate: session.gate_outcome(),
            rows,
            config,
            refcounts,
            queue: QueueDepths {
                config: session.queue().depth(WaitQueue::Config),
                oper: session.queue().depth(WaitQueue::Oper),
            },
            controller_history: session.controller_history().snapshot(),
            device_history: session.device_history().snapshot(),
        }
    }
}
