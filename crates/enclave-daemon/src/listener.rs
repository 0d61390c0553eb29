//! Per-group listener loop.
//!
//! ```text
//! Connecting ──ok──▶ Connected ──event──▶ Processing ──▶ Connected
//!     ▲                  │
//!     │              closed/error
//!     │                  ▼
//!     └──backoff── Reconnecting
//! ```
//!
//! Each group runs in its own task. The shutdown signal is only observed
//! between events, so an event being processed always finishes first.
//! Processing itself runs on the blocking pool since it does MLS work and
//! fsyncs. The transport is closed whenever the loop leaves a connection.
//! On reconnect the subscription resumes from the group's `last_event_at`
//! cursor; overlap is absorbed by the processed-id index.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use enclave_proto::{kind, Event, Filter};
use enclave_store::{DefaultPolicy, Store};

use crate::pipeline::{Outcome, Pipeline};
use crate::relay::{RelayEvent, TransportFactory};
use crate::status::{ListenerState, StatusEvent};

pub struct GroupListener {
    pub group_id: String,
    pub store: Store,
    pub pipeline: Arc<Pipeline>,
    pub factory: Arc<dyn TransportFactory>,
    pub default_relays: Vec<String>,
    pub backoff: Duration,
    pub status: mpsc::UnboundedSender<StatusEvent>,
}

impl GroupListener {
    fn emit(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }

    fn set_state(&self, state: ListenerState) {
        debug!(group = %self.group_id, ?state, "listener state");
        self.emit(StatusEvent::State {
            group: self.group_id.clone(),
            state,
        });
    }

    /// Sleep for the backoff period. Returns `true` if shutdown was requested
    /// meanwhile.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ListenerState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => false,
            res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
        }
    }

    fn filter(&self) -> Option<Filter> {
        let record = match self.store.load_group(&self.group_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(group = %self.group_id, "group vanished from store");
                return None;
            }
            Err(e) => {
                warn!(group = %self.group_id, error = %e, "cannot load group");
                return None;
            }
        };
        let mut filter = Filter::new()
            .kind(kind::GROUP_MESSAGE)
            .group(record.transport_id);
        if let Some(since) = record.last_event_at {
            filter = filter.since(since);
        }
        Some(filter)
    }

    fn relays(&self) -> Vec<String> {
        match self.store.load_group(&self.group_id) {
            Ok(Some(record)) if !record.relays.is_empty() => record.relays,
            _ => self.default_relays.clone(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(group = %self.group_id, "listener started");
        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ListenerState::Connecting);

            let relays = self.relays();
            let connected = tokio::select! {
                res = self.factory.connect(&relays) => res,
                _ = shutdown.changed() => break 'outer,
            };
            let transport = match connected {
                Ok(t) => t,
                Err(e) => {
                    warn!(group = %self.group_id, error = %e, "connect failed");
                    if self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(filter) = self.filter() else {
                if self.back_off(&mut shutdown).await {
                    break;
                }
                continue;
            };
            let mut sub = match transport.subscribe(filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(group = %self.group_id, error = %e, "subscribe failed");
                    transport.close().await;
                    if self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            self.set_state(ListenerState::Connected);

            let stop = loop {
                tokio::select! {
                    biased;
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break true;
                        }
                    }
                    next = sub.next() => match next {
                        Some(RelayEvent::Event(event)) => {
                            self.set_state(ListenerState::Processing);
                            self.process(event).await;
                            self.set_state(ListenerState::Connected);
                        }
                        Some(RelayEvent::EndOfStored) => {
                            debug!(group = %self.group_id, "caught up with stored events");
                        }
                        Some(RelayEvent::Closed(reason)) => {
                            warn!(group = %self.group_id, reason = %reason, "subscription closed");
                            break false;
                        }
                        None => {
                            warn!(group = %self.group_id, "subscription ended");
                            break false;
                        }
                    }
                }
            };
            drop(sub);
            transport.close().await;
            if stop {
                break;
            }

            if self.back_off(&mut shutdown).await {
                break;
            }
        }
        self.set_state(ListenerState::Stopped);
        info!(group = %self.group_id, "listener stopped");
    }

    async fn process(&self, event: Event) {
        let group = self.group_id.clone();
        let event_id = event.id.clone();
        let pipeline = self.pipeline.clone();
        let group_id = self.group_id.clone();
        let handled = tokio::task::spawn_blocking(move || pipeline.handle(&group_id, &event)).await;
        let result = match handled {
            Ok(result) => result,
            Err(e) => {
                warn!(group = %group, event_id = %event_id, error = %e, "processing task failed");
                self.emit(StatusEvent::Diagnostic {
                    group,
                    event_id,
                    error: e.to_string(),
                });
                return;
            }
        };
        match result {
            Ok(Outcome::Delivered(message)) => {
                info!(group = %group, message_id = %message.id, "message delivered");
                self.emit(StatusEvent::Message {
                    group,
                    message_id: message.id,
                    sender: message.sender.short(),
                });
            }
            Ok(Outcome::Redacted { sender, policy, .. }) => {
                let sender = sender.short();
                if policy == DefaultPolicy::LogOnly {
                    self.emit(StatusEvent::Rejected {
                        group: group.clone(),
                        sender: sender.clone(),
                    });
                }
                self.emit(StatusEvent::Redacted { group, sender });
            }
            Ok(Outcome::Committed { epoch, committer }) => {
                info!(group = %group, epoch, committer = %committer.short(), "commit merged");
                self.emit(StatusEvent::Commit { group, epoch });
            }
            Ok(Outcome::Proposal { sender }) => {
                debug!(group = %group, sender = %sender.short(), "proposal stored");
            }
            Ok(Outcome::Duplicate) => {
                debug!(group = %group, event_id = %event_id, "duplicate event skipped");
            }
            Ok(Outcome::Ignored(reason)) => {
                debug!(group = %group, event_id = %event_id, reason, "event ignored");
            }
            Err(e) => {
                warn!(group = %group, event_id = %event_id, error = %e, "event skipped");
                self.emit(StatusEvent::Diagnostic {
                    group,
                    event_id,
                    error: e.to_string(),
                });
            }
        }
    }
}
