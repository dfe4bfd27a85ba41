//! Outbound resilience events.
//!
//! Breakers, balancers and the scaling evaluator publish here after their
//! own state has been updated, so subscribers never run under a state lock.

use crate::breaker::CircuitState;
use crate::scaling::ScalingEvent;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default channel capacity. Slow subscribers lag rather than block publishers.
const DEFAULT_CAPACITY: usize = 256;

/// Something an operator layer may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A circuit breaker changed state.
    BreakerStateChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A health check flipped an instance between healthy and unhealthy.
    InstanceHealthChanged {
        service: String,
        instance: String,
        healthy: bool,
    },
    /// A scaling rule fired and passed its bounds and cooldown.
    ScalingRecommended(ScalingEvent),
}

/// Broadcast channel for [`ResilienceEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    /// Create an event bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an event bus that buffers up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ResilienceEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ResilienceEvent::InstanceHealthChanged {
            service: "api".to_string(),
            instance: "api-1".to_string(),
            healthy: false,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ResilienceEvent::InstanceHealthChanged {
                service: "api".to_string(),
                instance: "api-1".to_string(),
                healthy: false,
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(ResilienceEvent::BreakerStateChanged {
            breaker: "db".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ResilienceEvent::BreakerStateChanged {
            breaker: "db".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"breaker_state_changed""#));
        assert!(json.contains(r#""to":"open""#));
    }
}
