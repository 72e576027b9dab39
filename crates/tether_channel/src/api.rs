//! Typed remote interfaces
//!
//! The finite set of remote methods used across the boundary, each with a
//! typed signature. Anything else goes through `call_custom`, which maps to
//! a method registered by name on the other side.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tether_types::{HandleId, Value};

use crate::error::ChannelError;
use crate::host::HostChannel;
use crate::message::Target;
use crate::worker::WorkerChannel;

/// Well-known method names.
pub mod methods {
    /// Host: blocking line read for the worker's stdin
    pub const READ: &str = "read";
    /// Host: program output
    pub const WRITE: &str = "write";
    /// Host: suspend the caller for a number of milliseconds
    pub const SLEEP: &str = "sleep";
    /// Host: ask for access to a storage resource
    pub const REQUEST_PERMISSION: &str = "request_permission";
    /// Host: show a message to the end user
    pub const NOTIFY: &str = "notify";
    /// Worker: run source synchronously
    pub const RUN: &str = "run";
    /// Worker: run source in async mode
    pub const RUN_ASYNC: &str = "run_async";
}

/// Output stream of a `write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Stream::Stdout),
            "stderr" => Ok(Stream::Stderr),
            other => Err(format!("unknown stream: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker → Host
// ─────────────────────────────────────────────────────────────────────────────

/// What worker-side code can ask of its host. Every method blocks the
/// calling worker thread until the host answers.
pub trait HostApi: Send + Sync {
    fn read(&self, echo: Option<&str>) -> Result<String, ChannelError>;
    fn write(&self, stream: Stream, data: &str) -> Result<(), ChannelError>;
    fn sleep(&self, duration: Duration) -> Result<(), ChannelError>;
    /// Denial is an expected outcome and comes back as `Ok(false)`.
    fn request_permission(&self, resource: &str) -> Result<bool, ChannelError>;
    fn notify(&self, message: &str) -> Result<(), ChannelError>;
    fn call_custom(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError>;
}

/// [`HostApi`] over a worker channel.
#[derive(Clone)]
pub struct HostProxy {
    channel: Arc<WorkerChannel>,
}

impl HostProxy {
    pub fn new(channel: Arc<WorkerChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }
}

impl HostApi for HostProxy {
    fn read(&self, echo: Option<&str>) -> Result<String, ChannelError> {
        let args = echo.map(|e| vec![Value::str(e)]).unwrap_or_default();
        match self.channel.call_method(methods::READ, args)? {
            Value::Str(line) => Ok(line),
            other => Err(unexpected(methods::READ, "str", &other)),
        }
    }

    fn write(&self, stream: Stream, data: &str) -> Result<(), ChannelError> {
        self.channel.call_method(
            methods::WRITE,
            vec![Value::str(stream.as_str()), Value::str(data)],
        )?;
        Ok(())
    }

    fn sleep(&self, duration: Duration) -> Result<(), ChannelError> {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.channel
            .call_method(methods::SLEEP, vec![Value::Int(millis)])?;
        Ok(())
    }

    fn request_permission(&self, resource: &str) -> Result<bool, ChannelError> {
        match self
            .channel
            .call_method(methods::REQUEST_PERMISSION, vec![Value::str(resource)])?
        {
            Value::Bool(granted) => Ok(granted),
            other => Err(unexpected(methods::REQUEST_PERMISSION, "bool", &other)),
        }
    }

    fn notify(&self, message: &str) -> Result<(), ChannelError> {
        self.channel
            .call_method(methods::NOTIFY, vec![Value::str(message)])?;
        Ok(())
    }

    fn call_custom(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError> {
        self.channel.call_method(method, args)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host → Worker
// ─────────────────────────────────────────────────────────────────────────────

/// What the host can ask of a worker.
#[derive(Clone)]
pub struct WorkerProxy {
    channel: HostChannel,
}

impl WorkerProxy {
    pub fn new(channel: HostChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &HostChannel {
        &self.channel
    }

    /// Run source in the worker's interpreter, through its lifecycle.
    pub async fn run(&self, code: &str) -> Result<Value, ChannelError> {
        self.channel
            .call_method(methods::RUN, vec![Value::str(code)])
            .await
    }

    pub async fn run_async(&self, code: &str) -> Result<Value, ChannelError> {
        self.channel
            .call_method(methods::RUN_ASYNC, vec![Value::str(code)])
            .await
    }

    /// Call a callable the worker exposed as a handle.
    pub async fn call_handle(&self, handle: HandleId, args: Vec<Value>) -> Result<Value, ChannelError> {
        self.channel.call(Target::Handle(handle), args).await
    }

    pub async fn call_custom(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError> {
        self.channel.call_method(method, args).await
    }
}

fn unexpected(method: &str, expected: &'static str, got: &Value) -> ChannelError {
    ChannelError::UnexpectedReply {
        method: method.to_string(),
        expected,
        got: got.kind(),
    }
}
