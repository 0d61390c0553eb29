//! Relay transport.
//!
//! `RelayTransport` is the seam between the daemon and the network. The
//! WebSocket client (`WsRelay`), its multi-relay fan-in (`RelayPool`) and the
//! in-process `MemoryRelay` all implement it, so listener and pipeline code
//! never know which one they are talking to.

pub mod memory;
pub mod pool;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use enclave_proto::{Event, Filter, ProtoError};

pub use memory::MemoryRelay;
pub use pool::RelayPool;
pub use ws::WsRelay;

/// Buffered relay events per subscription.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("no relays configured")]
    NoRelays,

    #[error("relay connection lost")]
    Disconnected,

    #[error("event rejected by relay: {0}")]
    Rejected(String),

    #[error("relay did not acknowledge within {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Event(Event),
    /// All stored events matching the filter have been delivered.
    EndOfStored,
    /// The relay ended the subscription or the connection dropped.
    Closed(String),
}

pub struct Subscription {
    pub id: String,
    rx: mpsc::Receiver<RelayEvent>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, rx: mpsc::Receiver<RelayEvent>) -> Self {
        Self { id: id.into(), rx }
    }

    /// `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError>;

    /// Stored events matching `filter`, collected until end-of-stored or
    /// `timeout`, whichever comes first.
    async fn query(&self, filter: Filter, timeout: Duration) -> Result<Vec<Event>, RelayError> {
        let mut sub = self.subscribe(filter).await?;
        let mut events = Vec::new();
        let collect = async {
            while let Some(ev) = sub.next().await {
                match ev {
                    RelayEvent::Event(event) => events.push(event),
                    RelayEvent::EndOfStored | RelayEvent::Closed(_) => break,
                }
            }
        };
        // a slow relay yields whatever arrived in time
        let _ = tokio::time::timeout(timeout, collect).await;
        Ok(events)
    }

    /// End live subscriptions and release the connection. Dropping a
    /// transport without calling this tears it down without telling the relay.
    async fn close(&self) {}
}

/// Opens a transport for a group's relay list. The listener calls it again
/// on every reconnect.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, relays: &[String]) -> Result<Arc<dyn RelayTransport>, RelayError>;
}

/// WebSocket relays.
pub struct WsFactory {
    pub publish_timeout: Duration,
}

#[async_trait]
impl TransportFactory for WsFactory {
    async fn connect(&self, relays: &[String]) -> Result<Arc<dyn RelayTransport>, RelayError> {
        let pool = RelayPool::connect(relays, self.publish_timeout).await?;
        Ok(Arc::new(pool))
    }
}
