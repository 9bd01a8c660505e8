// ── Cached device rows ──

use std::time::Duration;

use hwvtep_api::Row;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::Instant;

use super::{DeviceId, ModelKey};

/// Lifecycle status of a cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RowStatus {
    /// A mutation was submitted and its outcome is unconfirmed. Neither
    /// safely absent nor confirmed present.
    InTransit,
    /// Known to the controller, not present on the device.
    Unavailable,
    /// Confirmed on the device.
    Available,
}

/// One row as the engine last observed it.
///
/// Fields are private so the status invariants hold by construction: a
/// row with a payload is never `Unavailable`, and an `InTransit` row
/// always carries the instant it went in transit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    key: ModelKey,
    device_id: Option<DeviceId>,
    payload: Option<Row>,
    status: RowStatus,
    in_transit_since: Option<Instant>,
}

impl DeviceRow {
    /// A row the device has confirmed.
    pub fn available(key: ModelKey, device_id: DeviceId, payload: Row) -> Self {
        Self {
            key,
            device_id: Some(device_id),
            payload: Some(payload),
            status: RowStatus::Available,
            in_transit_since: None,
        }
    }

    pub fn unavailable(key: ModelKey) -> Self {
        Self {
            key,
            device_id: None,
            payload: None,
            status: RowStatus::Unavailable,
            in_transit_since: None,
        }
    }

    /// A reservation for a row nothing is known about yet.
    pub fn in_transit(key: ModelKey, since: Instant) -> Self {
        Self {
            key,
            device_id: None,
            payload: None,
            status: RowStatus::InTransit,
            in_transit_since: Some(since),
        }
    }

    /// Same row, flipped to in transit. Device id and payload are kept.
    pub fn into_in_transit(self, since: Instant) -> Self {
        Self {
            status: RowStatus::InTransit,
            in_transit_since: Some(since),
            ..self
        }
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub fn payload(&self) -> Option<&Row> {
        self.payload.as_ref()
    }

    pub fn status(&self) -> RowStatus {
        self.status
    }

    pub fn in_transit_since(&self) -> Option<Instant> {
        self.in_transit_since
    }

    pub fn is_available(&self) -> bool {
        self.status == RowStatus::Available
    }

    pub fn is_in_transit(&self) -> bool {
        self.status == RowStatus::InTransit
    }

    /// Time spent in transit as of `now`.
    pub fn in_transit_age(&self, now: Instant) -> Option<Duration> {
        self.in_transit_since
            .filter(|_| self.is_in_transit())
            .map(|since| now.saturating_duration_since(since))
    }
}
