// =============================================================================
// Event bus — typed broadcast channel replacing per-component emitters
// =============================================================================
//
// Every cross-component notification flows through one `Event` enum on a
// `tokio::sync::broadcast` channel. Producers never block on slow consumers:
// a lagging subscriber gets `RecvError::Lagged` from the channel itself and is
// expected to resynchronize from a snapshot rather than replay missed deltas.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{Direction, HologramStatus, PositionState};

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    HologramUpdated {
        symbol: String,
        status: HologramStatus,
        alignment_score: f64,
    },
    SessionChange {
        symbol: String,
        session: String,
    },
    CvdAbsorption {
        symbol: String,
        direction: Direction,
    },
    SignalGenerated {
        signal_id: String,
        symbol: String,
        direction: Direction,
    },
    ExecutionComplete {
        signal_id: String,
        symbol: String,
        fill_price: f64,
        slippage_bps: f64,
    },
    PositionUpdated {
        position_id: String,
        symbol: String,
        state: PositionState,
    },
    Emergency {
        kind: String,
        reason: String,
    },
    Error {
        component: String,
        message: String,
    },
    ConfigChanged {
        revision: u64,
    },
}

/// Default per-subscriber buffer. Consumers that fall this far behind drop to
/// a catch-up snapshot instead of reading stale deltas.
const DEFAULT_CAPACITY: usize = 1024;

/// Thin wrapper over `broadcast::Sender` so callers don't need to import
/// `tokio::sync::broadcast` directly, and so the default capacity lives in
/// one place.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // A send error just means there are currently no subscribers; that's
        // a normal state during startup/shutdown, not a failure to log.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::ConfigChanged { revision: 1 });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::SessionChange {
            symbol: "BTCUSDT".into(),
            session: "LONDON".into(),
        });
        let evt = rx.recv().await.unwrap();
        matches!(evt, Event::SessionChange { .. });
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_lagged_not_a_block() {
        let bus_inner = broadcast::channel::<Event>(2).0;
        let bus = EventBus { tx: bus_inner };
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::ConfigChanged { revision: i });
        }
        let err = rx.try_recv();
        assert!(matches!(err, Err(broadcast::error::TryRecvError::Lagged(_))));
    }
}
