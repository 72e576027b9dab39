//! Interpreter seam
//!
//! The engines themselves live outside this crate. The lifecycle only needs
//! an opaque capability set: run code, run code in async mode, install a
//! native module, and swap the standard streams.

mod shell;

pub use shell::{ShellFactory, ShellInterpreter, SHELL_KIND, SHELL_VERSION};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tether_types::{NativeFunction, Value};

/// An error raised by interpreted code, or by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InterpreterError {
    pub kind: String,
    pub message: String,
}

impl InterpreterError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A native module: a namespace of callables visible to interpreted code.
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: BTreeMap<String, NativeFunction>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(mut self, func: NativeFunction) -> Self {
        self.insert(func);
        self
    }

    pub fn insert(&mut self, func: NativeFunction) {
        self.functions.insert(func.name().to_string(), func);
    }

    pub fn function(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Output stream hook. Engines either hand over whole buffers or single
/// bytes; implementations must accept both.
pub trait OutputSink: Send {
    fn write(&mut self, data: &str) -> io::Result<()>;

    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking input hook. `Ok(None)` is end of input.
pub trait InputSource: Send {
    fn read_line(&mut self, prompt: Option<&str>) -> io::Result<Option<String>>;
}

/// An interpreter engine instance.
pub trait Interpreter: Send {
    fn kind(&self) -> &str;

    fn version(&self) -> &str;

    fn run(&mut self, code: &str) -> Result<Value, InterpreterError>;

    fn run_async<'a>(&'a mut self, code: &'a str) -> BoxFuture<'a, Result<Value, InterpreterError>>;

    fn register_module(&mut self, namespace: &str, module: Module);

    fn set_stdout(&mut self, sink: Box<dyn OutputSink>);

    fn set_stderr(&mut self, sink: Box<dyn OutputSink>);

    fn set_stdin(&mut self, source: Box<dyn InputSource>);
}

impl fmt::Debug for dyn Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interpreter({} {})", self.kind(), self.version())
    }
}

/// Creates interpreters of one kind.
pub trait InterpreterFactory: Send + Sync {
    fn kind(&self) -> &str;

    /// `config` is the parsed worker configuration (`Value::Null` if none).
    fn create(&self, version: Option<&str>, config: &Value) -> Result<Box<dyn Interpreter>, InterpreterError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Stock sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Collects output in memory. Clones share the buffer.
#[derive(Clone, Default)]
pub struct BufferSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl OutputSink for BufferSink {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.buf.lock().extend_from_slice(data.as_bytes());
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.buf.lock().push(byte);
        Ok(())
    }
}

/// Discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _data: &str) -> io::Result<()> {
        Ok(())
    }

    fn write_byte(&mut self, _byte: u8) -> io::Result<()> {
        Ok(())
    }
}

/// Always at end of input.
pub struct NoInput;

impl InputSource for NoInput {
    fn read_line(&mut self, _prompt: Option<&str>) -> io::Result<Option<String>> {
        Ok(None)
    }
}

/// Pre-scripted input lines, mostly for tests.
pub struct ScriptedInput {
    lines: std::collections::VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl InputSource for ScriptedInput {
    fn read_line(&mut self, _prompt: Option<&str>) -> io::Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}
