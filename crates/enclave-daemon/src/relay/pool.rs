//! Several relays behind one `RelayTransport`.
//!
//! Publishes go to every relay and succeed if any accepts. Subscriptions
//! are merged: duplicate event ids are dropped, end-of-stored is reported
//! once every relay has sent it, and the first closed member subscription
//! closes the merged one so the caller reconnects the whole set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use enclave_proto::{Event, Filter};

use super::{RelayError, RelayEvent, RelayTransport, Subscription, WsRelay, SUBSCRIPTION_BUFFER};

pub struct RelayPool {
    relays: Vec<Arc<dyn RelayTransport>>,
}

impl RelayPool {
    /// Connect to every reachable relay in `urls`. Fails only if none is.
    pub async fn connect(urls: &[String], publish_timeout: Duration) -> Result<Self, RelayError> {
        if urls.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let attempts = join_all(urls.iter().map(|u| WsRelay::connect(u, publish_timeout))).await;
        let mut relays: Vec<Arc<dyn RelayTransport>> = Vec::new();
        let mut last_err = None;
        for (url, attempt) in urls.iter().zip(attempts) {
            match attempt {
                Ok(relay) => relays.push(Arc::new(relay)),
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay unreachable");
                    last_err = Some(e);
                }
            }
        }
        if relays.is_empty() {
            return Err(last_err.unwrap_or(RelayError::NoRelays));
        }
        Ok(Self { relays })
    }

    pub fn from_transports(relays: Vec<Arc<dyn RelayTransport>>) -> Self {
        Self { relays }
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let results = join_all(self.relays.iter().map(|r| r.publish(event))).await;
        let mut last_err = None;
        let mut accepted = false;
        for result in results {
            match result {
                Ok(()) => accepted = true,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "relay publish failed");
                    last_err = Some(e);
                }
            }
        }
        match (accepted, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(RelayError::NoRelays),
        }
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError> {
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let mut members = Vec::with_capacity(self.relays.len());
        for relay in &self.relays {
            members.push(relay.subscribe(filter.clone()).await?);
        }

        let total = members.len();
        let (merged_tx, mut merged_rx) = mpsc::channel::<RelayEvent>(SUBSCRIPTION_BUFFER);
        for mut member in members {
            let merged_tx = merged_tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = member.next().await {
                    if merged_tx.send(ev).await.is_err() {
                        return;
                    }
                }
                let _ = merged_tx
                    .send(RelayEvent::Closed("relay subscription ended".into()))
                    .await;
            });
        }
        drop(merged_tx);

        let (out_tx, out_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut eose = 0;
            while let Some(ev) = merged_rx.recv().await {
                let forward = match ev {
                    RelayEvent::Event(event) => {
                        if !seen.insert(event.id.clone()) {
                            continue;
                        }
                        RelayEvent::Event(event)
                    }
                    RelayEvent::EndOfStored => {
                        eose += 1;
                        if eose != total {
                            continue;
                        }
                        RelayEvent::EndOfStored
                    }
                    closed @ RelayEvent::Closed(_) => {
                        let _ = out_tx.send(closed).await;
                        return;
                    }
                };
                if out_tx.send(forward).await.is_err() {
                    return;
                }
            }
        });

        Ok(Subscription::new(Uuid::new_v4().simple().to_string(), out_rx))
    }

    async fn close(&self) {
        join_all(self.relays.iter().map(|r| r.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use enclave_proto::builder;

    #[tokio::test]
    async fn merges_and_dedupes() {
        let a = MemoryRelay::new();
        let b = MemoryRelay::new();
        let pool = RelayPool::from_transports(vec![Arc::new(a.clone()), Arc::new(b.clone())]);

        let ev = builder::group_message(&[5; 32], "x".into()).unwrap();
        pool.publish(&ev).await.unwrap();
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);

        let mut sub = pool.subscribe(Filter::new()).await.unwrap();
        assert_eq!(sub.next().await, Some(RelayEvent::Event(ev)));
        assert_eq!(sub.next().await, Some(RelayEvent::EndOfStored));
    }

    #[tokio::test]
    async fn one_relay_closing_closes_merged() {
        let a = MemoryRelay::new();
        let b = MemoryRelay::new();
        let pool = RelayPool::from_transports(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        let mut sub = pool.subscribe(Filter::new()).await.unwrap();
        assert_eq!(sub.next().await, Some(RelayEvent::EndOfStored));
        a.disconnect_all();
        assert!(matches!(sub.next().await, Some(RelayEvent::Closed(_))));
    }

    #[tokio::test]
    async fn publish_succeeds_if_any_relay_accepts() {
        let a = MemoryRelay::new();
        let b = MemoryRelay::new();
        b.set_offline(true);
        let pool = RelayPool::from_transports(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        let ev = builder::group_message(&[5; 32], "x".into()).unwrap();
        pool.publish(&ev).await.unwrap();
        a.set_offline(true);
        let ev = builder::group_message(&[5; 32], "y".into()).unwrap();
        assert!(pool.publish(&ev).await.is_err());
    }

    #[tokio::test]
    async fn close_reaches_every_relay() {
        let a = MemoryRelay::new();
        let b = MemoryRelay::new();
        let pool = RelayPool::from_transports(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        pool.close().await;
        assert_eq!(a.close_count(), 1);
        assert_eq!(b.close_count(), 1);
    }

    #[tokio::test]
    async fn empty_pool_refuses() {
        assert!(matches!(
            RelayPool::connect(&[], Duration::from_secs(1)).await,
            Err(RelayError::NoRelays)
        ));
    }
}
