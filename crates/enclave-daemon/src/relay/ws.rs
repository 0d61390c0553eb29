//! Single WebSocket relay connection.
//!
//! One writer task drains an outgoing queue into the socket; one reader task
//! parses relay frames and routes them to subscriptions and pending
//! publishes. When the socket drops, every live subscription receives
//! `Closed`, which is what makes the listener reconnect. `close` sends a
//! CLOSE per live subscription and a close frame, in queue order, before
//! the writer exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use enclave_proto::{ClientMessage, Event, Filter, RelayMessage};

use super::{RelayError, RelayEvent, RelayTransport, Subscription, SUBSCRIPTION_BUFFER};

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<RelayEvent>>>>;
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>;

/// How long `close` waits for queued frames to reach the socket.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct WsRelay {
    url: String,
    outgoing: mpsc::Sender<Message>,
    subscribers: Subscribers,
    pending: PendingAcks,
    publish_timeout: Duration,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WsRelay {
    pub async fn connect(url: &str, publish_timeout: Duration) -> Result<Self, RelayError> {
        let (stream, _) = connect_async(url).await.map_err(|e| RelayError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (mut sink, mut source) = stream.split();
        info!(relay = %url, "relay connected");

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if sink.send(frame).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let subscribers: Subscribers = Arc::default();
        let pending: PendingAcks = Arc::default();
        let reader = {
            let subscribers = subscribers.clone();
            let pending = pending.clone();
            let outgoing = outgoing.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            dispatch(&text, &subscribers, &pending, &outgoing).await
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(relay = %url, error = %e, "relay read failed");
                            break;
                        }
                    }
                }
                info!(relay = %url, "relay connection closed");
                let subs: Vec<_> = subscribers.lock().drain().map(|(_, tx)| tx).collect();
                for tx in subs {
                    let _ = tx.send(RelayEvent::Closed("connection lost".into())).await;
                }
                pending.lock().clear();
            })
        };

        Ok(Self {
            url: url.to_string(),
            outgoing,
            subscribers,
            pending,
            publish_timeout,
            reader,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        let text = message.to_json()?;
        self.outgoing
            .send(Message::Text(text))
            .await
            .map_err(|_| RelayError::Disconnected)
    }
}

async fn dispatch(
    text: &str,
    subscribers: &Subscribers,
    pending: &PendingAcks,
    outgoing: &mpsc::Sender<Message>,
) {
    let message = match RelayMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            trace!(error = %e, "unparseable relay frame");
            return;
        }
    };
    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => route(subscribers, outgoing, &subscription_id, RelayEvent::Event(event)).await,
        RelayMessage::EndOfStoredEvents(subscription_id) => {
            route(subscribers, outgoing, &subscription_id, RelayEvent::EndOfStored).await
        }
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            let tx = subscribers.lock().remove(&subscription_id);
            if let Some(tx) = tx {
                let _ = tx.send(RelayEvent::Closed(message)).await;
            }
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(ack) = pending.lock().remove(&event_id) {
                let _ = ack.send((accepted, message));
            }
        }
        RelayMessage::Notice(notice) => debug!(notice = %notice, "relay notice"),
    }
}

async fn route(
    subscribers: &Subscribers,
    outgoing: &mpsc::Sender<Message>,
    subscription_id: &str,
    event: RelayEvent,
) {
    let tx = subscribers.lock().get(subscription_id).cloned();
    let Some(tx) = tx else {
        return;
    };
    if tx.send(event).await.is_err() {
        // subscriber went away; tell the relay
        subscribers.lock().remove(subscription_id);
        if let Ok(close) = ClientMessage::Close(subscription_id.to_string()).to_json() {
            let _ = outgoing.send(Message::Text(close)).await;
        }
    }
}

#[async_trait]
impl RelayTransport for WsRelay {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().insert(event.id.clone(), ack_tx);
        self.send(ClientMessage::Event(event.clone())).await?;

        match tokio::time::timeout(self.publish_timeout, ack_rx).await {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, message))) => Err(RelayError::Rejected(message)),
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&event.id);
                Err(RelayError::Timeout(self.publish_timeout))
            }
        }
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError> {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().insert(id.clone(), tx);
        self.send(ClientMessage::Req {
            subscription_id: id.clone(),
            filters: vec![filter],
        })
        .await?;
        Ok(Subscription::new(id, rx))
    }

    async fn close(&self) {
        let ids: Vec<String> = self.subscribers.lock().drain().map(|(id, _)| id).collect();
        for id in ids {
            if self.send(ClientMessage::Close(id)).await.is_err() {
                break;
            }
        }
        let _ = self.outgoing.send(Message::Close(None)).await;
        self.pending.lock().clear();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, writer).await.is_err() {
                debug!(relay = %self.url, "writer did not drain before timeout");
            }
        }
        info!(relay = %self.url, "relay closed");
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}
