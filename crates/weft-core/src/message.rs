//! Wire message model.
//!
//! Every message carries a channel id. Call channels and stream-argument
//! channels share one id space per caller endpoint, so a peer can route any
//! message by id alone without knowing which role the channel plays.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies one call channel or stream-argument channel.
///
/// Allocated from a single monotonic counter per caller endpoint; ids are
/// never reused within the lifetime of an endpoint.
pub type ChannelId = u64;

/// Opaque handle to a transferable sub-channel.
///
/// The token is meaningful to the transport that minted it; the protocol core
/// only moves it around.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortToken(pub u64);

/// Self-describing payload value.
///
/// `Bytes` and `Port` are *movable*: a transport may transfer them by
/// reference instead of copying. [`Value::is_movable`] is what the transfer
/// extraction heuristic in [`crate::wire`] keys on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Port(PortToken),
}

impl Value {
    /// Whether a transport may move this value instead of copying it.
    pub fn is_movable(&self) -> bool {
        matches!(self, Value::Bytes(_) | Value::Port(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// An error as it travels on the wire.
///
/// The remote side reduces whatever its handler produced to a message plus an
/// optional stack; the receiving side rebuilds a local error from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        RemoteError {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        RemoteError {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The six message kinds of the protocol.
///
/// `Call` and `Resolve` only flow caller → callee and callee → caller
/// respectively; the stream-lifecycle kinds (`Next`, `Error`, `Complete`,
/// `Close`) flow both ways depending on which side owns the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Open a call channel and invoke `method` with `args`.
    ///
    /// Positions listed in `stream_args` carry a placeholder in `args`; the
    /// actual argument values arrive as `Next` messages on the listed
    /// channel ids.
    Call {
        channel_id: ChannelId,
        method: String,
        args: Vec<Value>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_stream_args"
        )]
        stream_args: Option<BTreeMap<usize, ChannelId>>,
    },
    /// The consuming side has lost interest in a channel.
    Close { channel_id: ChannelId },
    /// One value on a stream channel.
    Next { channel_id: ChannelId, data: Value },
    /// Terminal failure of a channel.
    Error {
        channel_id: ChannelId,
        data: RemoteError,
    },
    /// Graceful end of a stream channel.
    Complete { channel_id: ChannelId },
    /// Single-value settlement of a call channel.
    Resolve { channel_id: ChannelId, data: Value },
}

/// JSON map keys are strings, and the internally tagged `Message` enum
/// buffers its content during deserialization, which defeats serde_json's
/// own string-to-integer key handling. Parse the keys back explicitly.
fn deserialize_stream_args<'de, D>(
    deserializer: D,
) -> Result<Option<BTreeMap<usize, ChannelId>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, ChannelId>>::deserialize(deserializer)?;
    raw.map(|map| {
        map.into_iter()
            .map(|(k, v)| k.parse::<usize>().map(|k| (k, v)).map_err(serde::de::Error::custom))
            .collect()
    })
    .transpose()
}

impl Message {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Message::Call { channel_id, .. }
            | Message::Close { channel_id }
            | Message::Next { channel_id, .. }
            | Message::Error { channel_id, .. }
            | Message::Complete { channel_id }
            | Message::Resolve { channel_id, .. } => *channel_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Call { .. } => "CALL",
            Message::Close { .. } => "CLOSE",
            Message::Next { .. } => "NEXT",
            Message::Error { .. } => "ERROR",
            Message::Complete { .. } => "COMPLETE",
            Message::Resolve { .. } => "RESOLVE",
        }
    }
}

/// A message plus the movable values extracted from its payload.
///
/// Transports that support moving resources (ports, large buffers) consult
/// `movables`; transports that do not simply carry them inline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub movables: Vec<Value>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Envelope {
            message,
            movables: Vec::new(),
        }
    }

    pub fn with_movables(message: Message, movables: Vec<Value>) -> Self {
        Envelope { message, movables }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Envelope::new(message)
    }
}
