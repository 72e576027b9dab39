//! Tether
//!
//! Run embedded interpreters on worker threads and drive them from a host
//! context. Each context owns a hook registry and a lifecycle: hooks fire
//! around every run on both sides of the channel, and a worker's blocking
//! calls back into the host look synchronous from inside the interpreter.

pub mod config;
pub mod environment;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod interpreter;
pub mod lifecycle;
pub mod notify;
pub mod stdio;
pub mod storage;
pub mod terminal;
pub mod worker;

pub use config::{ConfigFormat, ConfigSource, Settings};
pub use environment::{Environment, EnvironmentBuilder, Plugin};
pub use error::{ConfigError, FetchError, HookError, RunError, StorageError, WorkerError};
pub use fetch::{FileFetch, SourceFetch, SourceRef};
pub use hooks::{Callback, Hook, HookContext, Hooks, Phase, Role, RolePolicy};
pub use interpreter::{Interpreter, InterpreterError, InterpreterFactory};
pub use lifecycle::{AfterRunOrder, Lifecycle, RunDescriptor, RunMode, RunScope};
pub use notify::{MemoryNotifier, Notify, TracingNotifier};
pub use storage::Storage;
pub use terminal::{MemorySurface, StdoutSurface, Surface, TerminalDescriptor, TerminalSession};
pub use worker::{WorkerHandle, WorkerId, WorkerOptions};

pub use tether_channel::{ChannelError, RemoteError};
pub use tether_types::Value;
