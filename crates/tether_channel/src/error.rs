//! Error types for the call channel.

use tether_types::CodecError;

use crate::message::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The transport is gone. Fatal for every call on this channel.
    #[error("Channel closed")]
    Closed,

    /// The remote handler failed. The channel stays usable.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handler already registered: {0}")]
    HandlerExists(String),

    #[error("Unexpected reply from {method}: expected {expected}, got {got}")]
    UnexpectedReply {
        method: String,
        expected: &'static str,
        got: &'static str,
    },
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}
