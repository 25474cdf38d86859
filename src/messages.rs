//! Client/relay message vocabulary and the outbound channel handle
//!
//! Frames are JSON arrays with a leading verb. Inbound parsing is lenient
//! about what it reports (a bad frame costs a NOTICE, never the connection)
//! but strict about shape.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use serde_json::{json, Value};
use std::sync::Arc;

/// Messages a client sends to the relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    /// The event object is kept raw so an `OK` can still echo its id when
    /// the object turns out to be structurally malformed.
    Event {
        event: Value,
    },
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::protocol(format!("unparseable frame: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(mut elements) = value else {
            return Err(Error::protocol("frame must be a JSON array"));
        };
        if elements.is_empty() {
            return Err(Error::protocol("frame must not be empty"));
        }
        let verb = elements.remove(0);
        let verb = verb
            .as_str()
            .ok_or_else(|| Error::protocol("frame verb must be a string"))?;

        match verb {
            "REQ" => {
                let subscription_id = subscription_id(elements.first())?;
                let mut filters = elements[1..]
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<Vec<Filter>>>()?;
                if filters.is_empty() {
                    // A bare REQ subscribes to everything
                    filters.push(Filter::default());
                }
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(Self::Close {
                subscription_id: subscription_id(elements.first())?,
            }),
            "EVENT" => {
                let event = elements
                    .into_iter()
                    .next()
                    .filter(Value::is_object)
                    .ok_or_else(|| Error::protocol("EVENT frame must carry an event object"))?;
                Ok(Self::Event { event })
            }
            other => Err(Error::protocol(format!("unknown frame verb: {other}"))),
        }
    }
}

fn subscription_id(value: Option<&Value>) -> Result<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::protocol("subscription id must be a non-empty string"))
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Arc<Event>,
    },
    Eose {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn event(subscription_id: impl Into<String>, event: Arc<Event>) -> Self {
        Self::Event {
            subscription_id: subscription_id.into(),
            event,
        }
    }

    pub fn eose(subscription_id: impl Into<String>) -> Self {
        Self::Eose {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    pub fn auth(challenge: impl Into<String>) -> Self {
        Self::Auth {
            challenge: challenge.into(),
        }
    }

    pub fn as_json(&self) -> String {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event.as_ref()]),
            Self::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Notice { message } => json!(["NOTICE", message]),
            Self::Auth { challenge } => json!(["AUTH", challenge]),
        };
        value.to_string()
    }
}

/// Handle for queueing messages toward one connection's transport. The
/// channel is bounded; a full queue means the client reads too slowly and is
/// reported distinctly from a closed one.
#[derive(Debug, Clone)]
pub struct MessageSender {
    sender: flume::Sender<RelayMessage>,
}

impl MessageSender {
    pub fn new(sender: flume::Sender<RelayMessage>) -> Self {
        Self { sender }
    }

    pub fn send(&self, message: RelayMessage) -> Result<()> {
        self.sender.try_send(message).map_err(|e| match e {
            flume::TrySendError::Full(_) => Error::internal("Channel full"),
            flume::TrySendError::Disconnected(_) => Error::internal("Channel disconnected"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{text_note, RelayKeys};

    #[test]
    fn parses_req_with_multiple_filter_sets() {
        let msg = ClientMessage::from_json(
            r#"["REQ","sub1",{"kinds":[1],"limit":10},{"authors":["ab"]}]"#,
        )
        .unwrap();
        let ClientMessage::Req {
            subscription_id,
            filters,
        } = msg
        else {
            panic!("expected REQ");
        };
        assert_eq!(subscription_id, "sub1");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].kinds, Some(vec![1]));
        assert_eq!(filters[1].authors, Some(vec!["ab".to_string()]));
    }

    #[test]
    fn bare_req_subscribes_to_everything() {
        let msg = ClientMessage::from_json(r#"["REQ","sub1"]"#).unwrap();
        let ClientMessage::Req { filters, .. } = msg else {
            panic!("expected REQ");
        };
        assert_eq!(filters, vec![Filter::default()]);
    }

    #[test]
    fn parses_close_and_event() {
        assert!(matches!(
            ClientMessage::from_json(r#"["CLOSE","sub1"]"#).unwrap(),
            ClientMessage::Close { subscription_id } if subscription_id == "sub1"
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"["EVENT",{"id":"00"}]"#).unwrap(),
            ClientMessage::Event { .. }
        ));
    }

    #[test]
    fn rejects_malformed_frames() {
        for raw in [
            "not json",
            r#"{"not":"an array"}"#,
            "[]",
            r#"[42,"sub"]"#,
            r#"["PING"]"#,
            r#"["REQ",""]"#,
            r#"["EVENT","not an object"]"#,
            r#"["REQ","sub",["not","an","object"]]"#,
        ] {
            assert!(ClientMessage::from_json(raw).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn relay_messages_serialize_to_wire_form() {
        assert_eq!(
            RelayMessage::ok("abc", false, "duplicate: already have it").as_json(),
            r#"["OK","abc",false,"duplicate: already have it"]"#
        );
        assert_eq!(
            RelayMessage::eose("sub1").as_json(),
            r#"["EOSE","sub1"]"#
        );
        assert_eq!(
            RelayMessage::auth("challenge-1").as_json(),
            r#"["AUTH","challenge-1"]"#
        );
        assert_eq!(
            RelayMessage::notice("stop that").as_json(),
            r#"["NOTICE","stop that"]"#
        );

        let keys = RelayKeys::generate();
        let event = Arc::new(text_note(&keys, "hi", 100));
        let json = RelayMessage::event("sub1", Arc::clone(&event)).as_json();
        assert!(json.starts_with(r#"["EVENT","sub1",{"#));
        assert!(json.contains(&event.id));
    }

    #[test]
    fn sender_reports_full_and_disconnected_channels() {
        let (tx, rx) = flume::bounded(1);
        let sender = MessageSender::new(tx);

        sender.send(RelayMessage::notice("one")).unwrap();
        let err = sender.send(RelayMessage::notice("two")).unwrap_err();
        assert!(err.to_string().contains("Channel full"));

        drop(rx);
        let err = sender.send(RelayMessage::notice("three")).unwrap_err();
        assert!(err.to_string().contains("Channel disconnected"));
    }
}
