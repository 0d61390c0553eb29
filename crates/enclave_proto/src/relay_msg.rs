//! Relay wire messages (JSON arrays over WebSocket text frames).
//!
//! Client → relay: `EVENT`, `REQ`, `CLOSE`
//! Relay → client: `EVENT`, `OK`, `EOSE`, `NOTICE`, `CLOSED`

use serde_json::{json, Value};

use crate::error::ProtoError;
use crate::event::Event;
use crate::filter::Filter;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        let value = match self {
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                for f in filters {
                    arr.push(serde_json::to_value(f)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close(id) => json!(["CLOSE", id]),
        };
        Ok(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn from_json(s: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(s)?;
        let arr = value
            .as_array()
            .ok_or_else(|| ProtoError::RelayMessage("not a JSON array".into()))?;
        let label = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::RelayMessage("missing label".into()))?;

        let str_at = |i: usize| -> Result<String, ProtoError> {
            arr.get(i)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| ProtoError::RelayMessage(format!("{label}: field {i} missing")))
        };

        match label {
            "EVENT" => {
                let event = arr
                    .get(2)
                    .cloned()
                    .ok_or_else(|| ProtoError::RelayMessage("EVENT: missing event".into()))?;
                Ok(RelayMessage::Event {
                    subscription_id: str_at(1)?,
                    event: serde_json::from_value(event)?,
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents(str_at(1)?)),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(1)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            other => Err(ProtoError::RelayMessage(format!("unknown label {other}"))),
        }
    }

    /// Relay-side encoding. Used by the in-process relay and tests.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::EndOfStoredEvents(id) => json!(["EOSE", id]),
            RelayMessage::Notice(msg) => json!(["NOTICE", msg]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
        };
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;

    #[test]
    fn req_shape() {
        let msg = ClientMessage::Req {
            subscription_id: "sub1".into(),
            filters: vec![Filter::new().kind(445)],
        };
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v[0], "REQ");
        assert_eq!(v[1], "sub1");
        assert_eq!(v[2]["kinds"][0], 445);
    }

    #[test]
    fn parse_relay_event() {
        let ev = builder::group_message(&[1; 32], "c".into()).unwrap();
        let wire = RelayMessage::Event {
            subscription_id: "s".into(),
            event: ev.clone(),
        }
        .to_json()
        .unwrap();
        match RelayMessage::from_json(&wire).unwrap() {
            RelayMessage::Event { event, .. } => assert_eq!(event, ev),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_ok_and_eose() {
        assert_eq!(
            RelayMessage::from_json(r#"["OK","abc",true,""]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: true,
                message: String::new()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents("s".into())
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json(r#"["AUTH","x"]"#).is_err());
    }
}
