//! Inbound event pipeline.
//!
//! One kind-445 event in, one `Outcome` out. Steps, in order:
//!
//! 1. kind, signature and routing tag
//! 2. already-processed ids are skipped
//! 3. outer decryption under the current epoch secret
//! 4. MLS processing
//! 5. for application messages: chat payload, sender binding, access gate
//! 6. persistence: message, then group state, then processed marker
//!
//! Any failure before step 6 leaves the store untouched. Traffic that is
//! not ours to read (other kinds, foreign payload formats) is ignored rather
//! than reported.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use enclave_core::access::{AccessControl, Decision};
use enclave_core::audit::{self, AuditLog};
use enclave_core::encryption::{decode_chat, decrypt_group_event};
use enclave_core::handlers::group_record;
use enclave_core::mls::{self, Incoming, MlsError};
use enclave_core::Enclave;
use enclave_crypto::{CryptoError, PublicKey};
use enclave_proto::{kind, Event, ProtoError};
use enclave_store::{DefaultPolicy, MessageRecord, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered(MessageRecord),
    Redacted {
        message_id: String,
        sender: PublicKey,
        policy: DefaultPolicy,
    },
    Committed {
        epoch: u64,
        committer: PublicKey,
    },
    Proposal {
        sender: PublicKey,
    },
    Duplicate,
    Ignored(&'static str),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ProtoError),

    #[error("event is not routed to this group")]
    Routing,

    #[error("outer decryption failed: {0}")]
    Decrypt(CryptoError),

    #[error("MLS processing failed: {0}")]
    Mls(#[from] MlsError),

    #[error("invalid chat payload: {0}")]
    Payload(ProtoError),

    #[error("chat author {author} is not the MLS sender {sender}")]
    SenderMismatch { author: String, sender: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("audit error: {0}")]
    Audit(anyhow::Error),
}

pub struct Pipeline {
    store: Store,
    access: Arc<AccessControl>,
    audit: Arc<AuditLog>,
}

impl Pipeline {
    pub fn new(enclave: &Enclave) -> Self {
        Self {
            store: enclave.store().clone(),
            access: enclave.access().clone(),
            audit: enclave.audit().clone(),
        }
    }

    pub fn handle(&self, group_id: &str, event: &Event) -> Result<Outcome, PipelineError> {
        if event.kind != kind::GROUP_MESSAGE {
            trace!(kind = event.kind, "ignoring non group-message event");
            return Ok(Outcome::Ignored("kind"));
        }
        event.verify()?;

        let record = self
            .store
            .load_group(group_id)?
            .ok_or_else(|| PipelineError::UnknownGroup(group_id.to_string()))?;
        if event.tag_values("h") != [record.transport_id.as_str()] {
            return Err(PipelineError::Routing);
        }
        if self.store.is_processed(group_id, &event.id)? {
            return Ok(Outcome::Duplicate);
        }

        let state = self.store.load_group_state(group_id)?;
        let secret = mls::derive_epoch_secret(&state)?;
        let mls_bytes = match decrypt_group_event(&secret, &event.content) {
            Ok(bytes) => bytes,
            Err(e) if e.is_foreign_format() => {
                trace!(event_id = %event.id, error = %e, "foreign payload format");
                return Ok(Outcome::Ignored("foreign format"));
            }
            Err(e) => return Err(PipelineError::Decrypt(e)),
        };
        let processed = mls::process_incoming_message(&state, &mls_bytes)?;

        let outcome = match processed.result {
            Incoming::Application { sender, plaintext } => {
                let rumor = decode_chat(&plaintext).map_err(PipelineError::Payload)?;
                if rumor.pubkey != sender {
                    return Err(PipelineError::SenderMismatch {
                        author: rumor.pubkey.short(),
                        sender: sender.short(),
                    });
                }
                let message = MessageRecord {
                    id: rumor.id,
                    group_id: group_id.to_string(),
                    event_id: Some(event.id.clone()),
                    sender,
                    content: rumor.content,
                    kind: rumor.kind,
                    created_at: rumor.created_at,
                    tags: rumor.tags,
                    redacted: false,
                };
                self.gate(group_id, event, message)?
            }
            Incoming::Commit { epoch, committer } => Outcome::Committed { epoch, committer },
            Incoming::Proposal { sender } => Outcome::Proposal { sender },
        };

        let mut updated = group_record(&processed.summary, &processed.state, Some(&record));
        updated.last_event_at = Some(
            record
                .last_event_at
                .map_or(event.created_at, |t| t.max(event.created_at)),
        );
        self.store.save_group(&updated, &processed.state)?;
        self.store.mark_processed(group_id, &event.id)?;
        debug!(group = %group_id, event_id = %event.id, epoch = updated.epoch, "event processed");
        Ok(outcome)
    }

    /// Store the message in full or as a placeholder, depending on policy.
    fn gate(
        &self,
        group_id: &str,
        event: &Event,
        message: MessageRecord,
    ) -> Result<Outcome, PipelineError> {
        match self.access.decide(&message.sender) {
            Decision::Allowed => {
                self.store.append_message(&message)?;
                Ok(Outcome::Delivered(message))
            }
            Decision::Denied {
                policy,
                log_rejected,
            } => {
                let sender = message.sender;
                let message_id = message.id.clone();
                self.store.append_message(&message.redact())?;
                self.audit
                    .record(
                        audit::MESSAGE_REDACTED,
                        false,
                        Some(&sender),
                        Some(group_id),
                        "sender not in allowed contacts",
                    )
                    .map_err(PipelineError::Audit)?;
                match policy {
                    DefaultPolicy::Ignore => {
                        debug!(group = %group_id, sender = %sender.short(), "message redacted")
                    }
                    DefaultPolicy::LogOnly => {
                        warn!(group = %group_id, sender = %sender.short(), "message from unknown sender redacted")
                    }
                }
                if log_rejected {
                    warn!(
                        group = %group_id,
                        sender = %sender.short(),
                        event_id = %event.id,
                        created_at = event.created_at,
                        "rejected message"
                    );
                }
                Ok(Outcome::Redacted {
                    message_id,
                    sender,
                    policy,
                })
            }
        }
    }
}
