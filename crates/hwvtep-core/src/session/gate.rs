// ── First-sync gate ──
//
// Commands issued before the first full device sync are held back and
// released together, in order, when the gate fires. The gate fires exactly
// once: on sync completion or when its deadline passes, whichever is first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum GateOutcome {
    Synced,
    TimedOut,
}

enum GateState<T> {
    Waiting { pending: Vec<T>, armed: bool },
    Fired(GateOutcome),
}

/// Two-state latch in front of a per-device submission channel.
///
/// The lock is held while forwarding, so items released on fire and items
/// submitted concurrently with it reach the sink in one total order: all
/// deferred items first, in submission order, then everything after.
pub struct ReconciliationGate<T> {
    state: Mutex<GateState<T>>,
    sink: mpsc::UnboundedSender<T>,
    timeout: Duration,
}

impl<T: Send + 'static> ReconciliationGate<T> {
    pub fn new(sink: mpsc::UnboundedSender<T>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Waiting {
                pending: Vec::new(),
                armed: false,
            }),
            sink,
            timeout,
        })
    }

    /// Forward `item` if the gate has fired, otherwise hold it. The first
    /// held item arms the deadline. Returns the item back if the sink is
    /// gone.
    pub fn submit(self: &Arc<Self>, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Fired(_) => self.sink.send(item).map_err(|e| e.0),
            GateState::Waiting { pending, armed } => {
                pending.push(item);
                if !*armed {
                    *armed = true;
                    debug!(timeout_ms = self.timeout_ms(), "reconciliation gate armed");
                    tokio::spawn(deadline(Arc::downgrade(self), self.timeout));
                }
                Ok(())
            }
        }
    }

    /// Open the gate and release every held item. Idempotent: returns
    /// `false` if the gate had already fired.
    pub fn fire(&self, outcome: GateOutcome) -> bool {
        let mut state = self.state.lock();
        let GateState::Waiting { pending, .. } = &mut *state else {
            return false;
        };
        let released = std::mem::take(pending);
        let count = released.len();
        for item in released {
            let _ = self.sink.send(item);
        }
        *state = GateState::Fired(outcome);
        info!(%outcome, released = count, "reconciliation gate fired");
        true
    }

    pub fn outcome(&self) -> Option<GateOutcome> {
        match &*self.state.lock() {
            GateState::Fired(outcome) => Some(*outcome),
            GateState::Waiting { .. } => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(&*self.state.lock(), GateState::Waiting { armed: true, .. })
    }

    /// Items currently held back.
    pub fn held(&self) -> usize {
        match &*self.state.lock() {
            GateState::Waiting { pending, .. } => pending.len(),
            GateState::Fired(_) => 0,
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

async fn deadline<T: Send + 'static>(gate: Weak<ReconciliationGate<T>>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(gate) = gate.upgrade() {
        gate.fire(GateOutcome::TimedOut);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn drain(rx: &mut mpsc::UnboundedReceiver<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn held_items_release_in_order_on_sync() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = ReconciliationGate::new(tx, TIMEOUT);

        for n in 1..=3 {
            gate.submit(n).unwrap();
        }
        assert!(gate.is_armed());
        assert_eq!(gate.held(), 3);
        assert!(drain(&mut rx).is_empty());

        assert!(gate.fire(GateOutcome::Synced));
        gate.submit(4).unwrap();
        gate.submit(5).unwrap();
        assert_eq!(drain(&mut rx), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = ReconciliationGate::new(tx, TIMEOUT);
        gate.submit(1).unwrap();

        assert!(gate.fire(GateOutcome::Synced));
        assert!(!gate.fire(GateOutcome::Synced));
        assert!(!gate.fire(GateOutcome::TimedOut));
        assert_eq!(gate.outcome(), Some(GateOutcome::Synced));
        assert_eq!(drain(&mut rx), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_after_first_held_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = ReconciliationGate::new(tx, TIMEOUT);

        // Nothing held: the deadline is not running.
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(gate.outcome(), None);

        gate.submit(7).unwrap();
        tokio::time::sleep(TIMEOUT - Duration::from_millis(1)).await;
        assert_eq!(gate.outcome(), None);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(gate.outcome(), Some(GateOutcome::TimedOut));
        assert_eq!(drain(&mut rx), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_before_deadline_wins() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = ReconciliationGate::new(tx, TIMEOUT);
        gate.submit(1).unwrap();
        gate.fire(GateOutcome::Synced);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(gate.outcome(), Some(GateOutcome::Synced));
    }

    #[tokio::test]
    async fn closed_sink_returns_item() {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = ReconciliationGate::new(tx, TIMEOUT);
        gate.fire(GateOutcome::Synced);
        drop(rx);
        assert_eq!(gate.submit(9), Err(9));
    }
}
