//! Error types for the tether environment.

use tether_channel::{ChannelError, RemoteError};
use tether_types::CodecError;

use crate::hooks::{Phase, Role};
use crate::interpreter::InterpreterError;

/// Hook registration errors.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{phase} expects {expected} hooks")]
    KindMismatch { phase: Phase, expected: &'static str },

    #[error("Cannot register a {role} {phase} hook from the {context} context")]
    WrongRole {
        role: Role,
        phase: Phase,
        context: Role,
    },

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),
}

/// Errors from one run through the lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A code-phase fragment failed. Configuration error: the run is aborted.
    #[error("{phase} hook code failed: {source}")]
    HookCode {
        phase: Phase,
        #[source]
        source: InterpreterError,
    },

    /// User code raised.
    #[error("{0}")]
    Execution(InterpreterError),

    /// The worker reported a failure for a remote run.
    #[error("Worker run failed: {0}")]
    Remote(RemoteError),

    /// The channel to the worker is gone.
    #[error("Worker channel failed: {0}")]
    Transport(ChannelError),
}

impl From<ChannelError> for RunError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Remote(remote) => RunError::Remote(remote),
            other => RunError::Transport(other),
        }
    }
}

/// Configuration loading and parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {format} config{}: {message}", at(.url))]
    Parse {
        format: &'static str,
        url: Option<String>,
        message: String,
    },

    #[error("Invalid settings: {0}")]
    Settings(#[from] Box<figment::Error>),
}

fn at(url: &Option<String>) -> String {
    url.as_deref().map(|u| format!(" at {u}")).unwrap_or_default()
}

/// Source fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unable to fetch {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Key-value storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

macro_rules! storage_from_redb {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StorageError {
            fn from(e: $ty) -> Self {
                StorageError::Database(redb::Error::from(e))
            }
        })*
    };
}

storage_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Worker creation and lifetime errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown interpreter: {0}")]
    UnknownInterpreter(String),

    #[error("Interpreter failed to start: {0}")]
    Interpreter(#[from] InterpreterError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}
