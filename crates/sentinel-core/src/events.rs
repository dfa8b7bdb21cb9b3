//! C8 — event-bus fanout.
//!
//! The engine posts one `HealthEvent` per mutation (verdict flip, add,
//! remove, clear) and every worker's subscriber task folds those events
//! back into its own `TargetIndex`. Subscriptions are held weakly from
//! the engine's point of view: a subscriber task's channel simply closes
//! when every `Engine` handle referencing the bus is dropped, the same
//! shape `tokio::sync::watch` gives a receiver once its sender is gone.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::target::Target;

/// One fanout notification. Verdict events carry the full `Target` so a
/// subscriber that has never seen it can synthesize an index entry
/// (§4.8's cross-worker propagation); `Removed` carries just the identity
/// triple; `Cleared` carries nothing because it applies to every target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Healthy { target: Target },
    Unhealthy { target: Target },
    MostlyHealthy { target: Target },
    MostlyUnhealthy { target: Target },
    Removed { ip: String, port: u16, hostname: Option<String> },
    Cleared,
}

/// A handle a worker holds open to receive events posted by any worker
/// sharing the same engine, including itself.
#[async_trait]
pub trait EventSubscription: Send {
    /// Waits for the next event. Returns `None` once the bus has been
    /// dropped and no further events will ever arrive.
    async fn recv(&mut self) -> Option<HealthEvent>;
}

/// The fanout boundary: anything that can publish and hand out fresh
/// subscriptions.
pub trait EventBus: Send + Sync {
    fn post(&self, event: HealthEvent);
    fn subscribe(&self) -> Box<dyn EventSubscription>;
}

/// `tokio::sync::broadcast`-backed bus for the in-process case (multiple
/// workers as tasks within one process). A cross-process reimplementation
/// would back `EventBus` with its own IPC channel instead.
pub struct InProcessBus {
    tx: broadcast::Sender<HealthEvent>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for InProcessBus {
    fn post(&self, event: HealthEvent) {
        // No active subscribers is not an error: posting is fire-and-forget.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> Box<dyn EventSubscription> {
        Box::new(BroadcastSubscription {
            rx: self.tx.subscribe(),
        })
    }
}

struct BroadcastSubscription {
    rx: broadcast::Receiver<HealthEvent>,
}

#[async_trait]
impl EventSubscription for BroadcastSubscription {
    async fn recv(&mut self) -> Option<HealthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // A slow subscriber that lagged behind just resumes at the
                // next available event rather than terminating; a verdict
                // it missed will still be reflected by the next one that
                // lands, since every event carries the full target.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    #[tokio::test]
    async fn subscriber_receives_posted_events() {
        let bus = InProcessBus::new(16);
        let mut sub = bus.subscribe();
        bus.post(HealthEvent::Healthy {
            target: Target::new("10.0.0.1", 80, None, None),
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(
            event,
            HealthEvent::Healthy {
                target: Target::new("10.0.0.1", 80, None, None),
            }
        );
    }

    #[tokio::test]
    async fn subscription_ends_once_the_bus_is_dropped() {
        let bus = InProcessBus::new(16);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_every_event() {
        let bus = InProcessBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.post(HealthEvent::Cleared);
        assert_eq!(a.recv().await, Some(HealthEvent::Cleared));
        assert_eq!(b.recv().await, Some(HealthEvent::Cleared));
    }
}
