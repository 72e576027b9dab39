//! Messages exchanged over a call channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use tether_types::{decode, encode, CodecError, HandleId, Object, Value, Wire};

/// Per-channel call identifier. Allocated from a monotonic counter and
/// never reused for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a call invokes on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// A method registered by name
    Method(String),
    /// A callable exposed through the remote reference table
    Handle(HandleId),
}

impl Target {
    pub fn method(name: impl Into<String>) -> Self {
        Target::Method(name.into())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Method(name) => write!(f, "{name}"),
            Target::Handle(id) => write!(f, "{id}"),
        }
    }
}

/// Failure raised by a remote handler, carried back to the call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// One message on the wire.
///
/// `args` is a single encoded list so that references shared between
/// arguments keep their identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Call { id: CallId, target: Target, args: Wire },
    Reply { id: CallId, value: Wire },
    Fail { id: CallId, error: RemoteError },
}

impl Message {
    pub fn id(&self) -> CallId {
        match self {
            Message::Call { id, .. } | Message::Reply { id, .. } | Message::Fail { id, .. } => *id,
        }
    }
}

/// Encode an argument list as one graph.
pub fn pack_args(args: Vec<Value>) -> Result<Wire, CodecError> {
    encode(&Value::list(args))
}

/// Decode an argument list packed by [`pack_args`].
pub fn unpack_args(wire: &Wire) -> Result<Vec<Value>, CodecError> {
    match decode(wire)? {
        Value::Object(obj) => match &*obj.read() {
            Object::List(items) => Ok(items.clone()),
            Object::Map(_) => Ok(vec![Value::Object(obj.clone())]),
        },
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}
