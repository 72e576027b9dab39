//! Tether Channel - synchronous-looking calls over message passing
//!
//! One channel pairs a host context with one worker context:
//!
//! - [`HostChannel`]: async endpoint. Calls are futures, inbound calls run
//!   as separate tasks.
//! - [`WorkerChannel`]: blocking endpoint for the worker thread. A call
//!   blocks the thread and serves nested inbound calls while it waits.
//! - [`HostApi`] / [`WorkerProxy`]: typed views over the two endpoints.
//!
//! Replies are matched strictly by call id. Closing either end fails every
//! pending call with [`ChannelError::Closed`].

mod api;
mod error;
mod host;
mod link;
mod message;
mod refs;
mod worker;

pub use api::{methods, HostApi, HostProxy, Stream, WorkerProxy};
pub use error::ChannelError;
pub use host::{HostChannel, HostHandler};
pub use link::{link_pair, HostLink, WorkerLink};
pub use message::{pack_args, unpack_args, CallId, Message, RemoteError, Target};
pub use refs::RefTable;
pub use worker::{WorkerChannel, WorkerHandler};
