//! The wire message record.
//!
//! Stores exchange tagged records: a kind, a path whose meaning depends on
//! the kind, and optional value / correlation-id / parameter fields. The
//! path is always expressed relative to the downstream store. Serialization
//! of these records is the transport's business; this module only fixes
//! their shape (absent fields are omitted).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::path::Path;
use crate::value::Value;

/// The kind tag of a [`Message`].
///
/// `Unknown` captures any foreign tag on deserialization so the
/// demultiplexer can reject it explicitly instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Request a value; correlated with a fresh id.
    Get,
    /// Reply to a `get`; echoes path and id.
    Value,
    /// Write a value; uncorrelated.
    Set,
    /// Append to a sequence; uncorrelated.
    Push,
    /// Install a subscription chain link; carries the chain id.
    Subscribe,
    /// A change notification travelling up a chain; carries the chain id.
    Event,
    /// Tear down every link with the carried id.
    Unsubscribe,
    /// Any tag this implementation does not know.
    Unknown,
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "get" => MessageKind::Get,
            "value" => MessageKind::Value,
            "set" => MessageKind::Set,
            "push" => MessageKind::Push,
            "subscribe" => MessageKind::Subscribe,
            "event" => MessageKind::Event,
            "unsubscribe" => MessageKind::Unsubscribe,
            _ => MessageKind::Unknown,
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Get => "get",
            MessageKind::Value => "value",
            MessageKind::Set => "set",
            MessageKind::Push => "push",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Event => "event",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One message between two stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// What this message does.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Tree path, relative to the downstream store. Empty for kinds that
    /// carry none (`unsubscribe`).
    #[serde(default, skip_serializing_if = "Path::is_empty")]
    pub path: Path,

    /// Correlation identifier: fresh per `get`, chain-wide for
    /// subscriptions, echoed on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Carried value. Absent on a `set` means "remove the leaf"; absent on
    /// a `value` reply means the path did not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Parameters: the RPC argument or projection depth of a `get`, or a
    /// record with a `limit` for `push`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Delivery period of a `subscribe` (deliver every Nth event).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<u32>,
}

impl Message {
    fn new(kind: MessageKind, path: Path) -> Self {
        Message {
            kind,
            path,
            id: None,
            value: None,
            params: None,
            throttle: None,
        }
    }

    /// A `get` request with a fresh correlation id.
    pub fn get(path: Path, id: Uuid, params: Option<Value>) -> Self {
        Message {
            id: Some(id),
            params,
            ..Message::new(MessageKind::Get, path)
        }
    }

    /// A `value` reply, echoing the request's path and id.
    pub fn value(path: Path, id: Uuid, value: Option<Value>) -> Self {
        Message {
            id: Some(id),
            value,
            ..Message::new(MessageKind::Value, path)
        }
    }

    /// A `set`; an absent value removes the leaf.
    pub fn set(path: Path, value: Option<Value>, limit: Option<usize>) -> Self {
        Message {
            value,
            params: limit_params(limit),
            ..Message::new(MessageKind::Set, path)
        }
    }

    /// A `push` onto a sequence leaf.
    pub fn push(path: Path, value: Value, limit: Option<usize>) -> Self {
        Message {
            value: Some(value),
            params: limit_params(limit),
            ..Message::new(MessageKind::Push, path)
        }
    }

    /// A `subscribe` carrying the chain id and throttle.
    pub fn subscribe(path: Path, id: Uuid, throttle: u32) -> Self {
        Message {
            id: Some(id),
            throttle: Some(throttle),
            ..Message::new(MessageKind::Subscribe, path)
        }
    }

    /// An `event` travelling upstream.
    pub fn event(path: Path, id: Uuid, value: Option<Value>) -> Self {
        Message {
            id: Some(id),
            value,
            ..Message::new(MessageKind::Event, path)
        }
    }

    /// An `unsubscribe` for every link with the given id.
    pub fn unsubscribe(id: Uuid) -> Self {
        Message {
            id: Some(id),
            ..Message::new(MessageKind::Unsubscribe, Path::root())
        }
    }

    /// The `limit` field of the params record, if present and nonnegative.
    pub fn limit(&self) -> Option<usize> {
        match self.params.as_ref()?.get(&Path::parse("limit"))? {
            Value::Integer(n) if *n >= 0 => Some(*n as usize),
            _ => None,
        }
    }
}

fn limit_params(limit: Option<usize>) -> Option<Value> {
    limit.map(|n| {
        let mut params = Value::map();
        // The path is a single literal segment; set into a fresh map cannot fail.
        let _ = params.set(&Path::parse("limit"), Value::Integer(n as i64));
        params
    })
}
