//! In-process relay.
//!
//! Stores every published event and pushes it to live subscriptions whose
//! filter matches. Clones share one hub, so two enclaves in the same process
//! can talk through it. `disconnect_all` and `set_offline` simulate network
//! loss for reconnect paths.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use enclave_proto::{Event, Filter};

use super::{RelayError, RelayEvent, RelayTransport, Subscription, TransportFactory, SUBSCRIPTION_BUFFER};

#[derive(Default)]
struct Hub {
    events: Vec<Event>,
    subscriptions: Vec<(Filter, mpsc::Sender<RelayEvent>)>,
    offline: bool,
    connects: usize,
    closes: usize,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event ever accepted, in publish order.
    pub fn events(&self) -> Vec<Event> {
        self.hub.lock().events.clone()
    }

    /// Store an event without validation or fan-out. Lets tests plant
    /// traffic a real relay would have accepted earlier.
    pub fn inject(&self, event: Event) {
        self.hub.lock().events.push(event);
    }

    /// Close every live subscription.
    pub fn disconnect_all(&self) {
        let subs = std::mem::take(&mut self.hub.lock().subscriptions);
        for (_, tx) in subs {
            let _ = tx.try_send(RelayEvent::Closed("disconnected".into()));
        }
    }

    /// While offline, connect, publish and subscribe all fail.
    pub fn set_offline(&self, offline: bool) {
        self.hub.lock().offline = offline;
        if offline {
            self.disconnect_all();
        }
    }

    /// Number of successful `TransportFactory::connect` calls.
    pub fn connect_count(&self) -> usize {
        self.hub.lock().connects
    }

    /// Number of `RelayTransport::close` calls.
    pub fn close_count(&self) -> usize {
        self.hub.lock().closes
    }

    pub fn live_subscriptions(&self) -> usize {
        let mut hub = self.hub.lock();
        hub.subscriptions.retain(|(_, tx)| !tx.is_closed());
        hub.subscriptions.len()
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        event.verify()?;
        let mut hub = self.hub.lock();
        if hub.offline {
            return Err(RelayError::Disconnected);
        }
        if hub.events.iter().any(|e| e.id == event.id) {
            debug!(event_id = %event.id, "duplicate publish ignored");
            return Ok(());
        }
        hub.events.push(event.clone());
        hub.subscriptions.retain(|(filter, tx)| {
            if tx.is_closed() {
                return false;
            }
            if filter.matches(event) {
                if let Err(e) = tx.try_send(RelayEvent::Event(event.clone())) {
                    warn!(error = %e, "memory relay subscriber lagging, event dropped");
                }
            }
            true
        });
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError> {
        let mut hub = self.hub.lock();
        if hub.offline {
            return Err(RelayError::Disconnected);
        }
        let mut stored: Vec<Event> = hub
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        stored.sort_by_key(|e| e.created_at);
        if let Some(limit) = filter.limit {
            let skip = stored.len().saturating_sub(limit);
            stored.drain(..skip);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER.max(stored.len() + 1));
        for event in stored {
            let _ = tx.try_send(RelayEvent::Event(event));
        }
        let _ = tx.try_send(RelayEvent::EndOfStored);
        hub.subscriptions.push((filter, tx));
        Ok(Subscription::new(Uuid::new_v4().simple().to_string(), rx))
    }

    // Clones share the hub, so closing only counts; other handles keep
    // their subscriptions.
    async fn close(&self) {
        self.hub.lock().closes += 1;
    }
}

#[async_trait]
impl TransportFactory for MemoryRelay {
    async fn connect(&self, _relays: &[String]) -> Result<Arc<dyn RelayTransport>, RelayError> {
        let mut hub = self.hub.lock();
        if hub.offline {
            return Err(RelayError::Connect {
                url: "memory".into(),
                reason: "offline".into(),
            });
        }
        hub.connects += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_crypto::Identity;
    use enclave_proto::{builder, kind};

    fn note(transport: u8) -> Event {
        builder::group_message(&[transport; 32], "payload".into()).unwrap()
    }

    #[tokio::test]
    async fn stored_then_live() {
        let relay = MemoryRelay::new();
        let first = note(1);
        relay.publish(&first).await.unwrap();

        let filter = Filter::new().kind(kind::GROUP_MESSAGE).group(hex::encode([1u8; 32]));
        let mut sub = relay.subscribe(filter).await.unwrap();
        assert_eq!(sub.next().await, Some(RelayEvent::Event(first)));
        assert_eq!(sub.next().await, Some(RelayEvent::EndOfStored));

        relay.publish(&note(2)).await.unwrap();
        let live = note(1);
        relay.publish(&live).await.unwrap();
        assert_eq!(sub.next().await, Some(RelayEvent::Event(live)));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let relay = MemoryRelay::new();
        let mut ev = note(1);
        ev.content = "tampered".into();
        assert!(relay.publish(&ev).await.is_err());
        assert!(relay.events().is_empty());
    }

    #[tokio::test]
    async fn query_respects_limit() {
        let relay = MemoryRelay::new();
        let id = Identity::generate();
        for _ in 0..3 {
            let ev = builder::key_package(&id, "a2V5", &[]).unwrap();
            relay.inject(ev);
        }
        let got = relay
            .query(
                Filter::new().kind(kind::KEY_PACKAGE).author(id.public()).limit(1),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_subscriptions() {
        let relay = MemoryRelay::new();
        let mut sub = relay.subscribe(Filter::new()).await.unwrap();
        assert_eq!(sub.next().await, Some(RelayEvent::EndOfStored));
        relay.disconnect_all();
        assert!(matches!(sub.next().await, Some(RelayEvent::Closed(_))));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn offline_refuses_connect() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        assert!(relay.connect(&[]).await.is_err());
        relay.set_offline(false);
        assert!(relay.connect(&[]).await.is_ok());
        assert_eq!(relay.connect_count(), 1);
    }
}
