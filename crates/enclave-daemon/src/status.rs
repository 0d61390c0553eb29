use serde::Serialize;

/// Per-group connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Connecting,
    Connected,
    Processing,
    Reconnecting,
    Stopped,
}

/// What the daemon reports to whoever is watching: the CLI logs these, tests
/// assert on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    State {
        group: String,
        state: ListenerState,
    },
    Message {
        group: String,
        message_id: String,
        sender: String,
    },
    /// Content withheld from a sender outside the allowed contacts.
    Redacted {
        group: String,
        sender: String,
    },
    /// Same as `Redacted`, surfaced because the policy is `log_only`.
    Rejected {
        group: String,
        sender: String,
    },
    Commit {
        group: String,
        epoch: u64,
    },
    /// An inbound event was skipped because processing failed.
    Diagnostic {
        group: String,
        event_id: String,
        error: String,
    },
    /// Not served: the group is not in the allowed set.
    Skipped {
        group: String,
    },
}

impl StatusEvent {
    pub fn group(&self) -> &str {
        match self {
            StatusEvent::State { group, .. }
            | StatusEvent::Message { group, .. }
            | StatusEvent::Redacted { group, .. }
            | StatusEvent::Rejected { group, .. }
            | StatusEvent::Commit { group, .. }
            | StatusEvent::Diagnostic { group, .. }
            | StatusEvent::Skipped { group } => group,
        }
    }
}
