//! Interactive terminal protocol
//!
//! Turns host-side keystrokes into line reads for a blocked worker. The
//! worker calls the host's `read`, which parks a pending slot and puts the
//! session in `Reading`. Keystrokes are echoed and accumulated until `\r`
//! completes the line and resolves the slot. Keystrokes typed while no read
//! is pending are held and replayed by the next read. Program output that arrives
//! mid-line is queued and flushed once the line is done, so it never
//! interleaves with the echo.

use std::collections::VecDeque;
use std::io::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_channel::{methods, ChannelError, HostChannel, RemoteError};
use tether_types::Value;
use tokio::sync::oneshot;

use crate::interpreter::OutputSink;

/// Deletes the last accumulated character.
pub const BACKSPACE: char = '\x7f';
/// Completes the line.
pub const ENTER: char = '\r';
/// Cursor left, then delete one character.
pub const ERASE: &str = "\x1b[D\x1b[P";

// ─────────────────────────────────────────────────────────────────────────────
// Surfaces
// ─────────────────────────────────────────────────────────────────────────────

/// The visible display.
pub trait Surface: Send + Sync {
    fn write(&self, data: &str);
}

/// The process terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSurface;

impl Surface for StdoutSurface {
    fn write(&self, data: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data.as_bytes()).and_then(|_| stdout.flush()) {
            tracing::warn!("[terminal] stdout write failed: {}", e);
        }
    }
}

/// Records everything written. Clones share the record.
#[derive(Debug, Default, Clone)]
pub struct MemorySurface {
    out: Arc<Mutex<String>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.out.lock().clone()
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.out.lock())
    }
}

impl Surface for MemorySurface {
    fn write(&self, data: &str) {
        self.out.lock().push_str(data);
    }
}

/// Interpreter output written straight to a surface. Single bytes are
/// collected until they form a whole character.
pub struct SurfaceSink {
    surface: Arc<dyn Surface>,
    pending: Vec<u8>,
}

impl SurfaceSink {
    pub fn new(surface: Arc<dyn Surface>) -> Self {
        Self {
            surface,
            pending: Vec::new(),
        }
    }
}

impl OutputSink for SurfaceSink {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.flush()?;
        self.surface.write(data);
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.pending.push(byte);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.surface.write(text);
                self.pending.clear();
                Ok(())
            }
            // Still waiting for the rest of a character.
            Err(e) if e.error_len().is_none() => Ok(()),
            Err(_) => self.flush(),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.surface.write(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        Ok(())
    }
}

/// A surface to attach to a worker.
#[derive(Clone)]
pub struct TerminalDescriptor {
    pub id: String,
    pub surface: Arc<dyn Surface>,
}

impl TerminalDescriptor {
    pub fn new(id: impl Into<String>, surface: Arc<dyn Surface>) -> Self {
        Self {
            id: id.into(),
            surface,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Reading,
    Writing,
}

struct SessionInner {
    state: SessionState,
    line: String,
    pending: Option<oneshot::Sender<String>>,
    queued: VecDeque<String>,
    /// Keystrokes that arrived with no read pending, replayed by the next read.
    typeahead: VecDeque<char>,
    /// Last character put on the surface was `\r`.
    after_cr: bool,
}

pub struct TerminalSession {
    id: String,
    surface: Arc<dyn Surface>,
    echo: bool,
    inner: Mutex<SessionInner>,
}

impl TerminalSession {
    pub fn new(descriptor: TerminalDescriptor, echo: bool) -> Self {
        Self {
            id: descriptor.id,
            surface: descriptor.surface,
            echo,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                line: String::new(),
                pending: None,
                queued: VecDeque::new(),
                typeahead: VecDeque::new(),
                after_cr: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Characters typed so far on the current line.
    pub fn line(&self) -> String {
        self.inner.lock().line.clone()
    }

    /// Start a line read. The receiver resolves when `\r` arrives.
    pub fn begin_read(&self, prompt: Option<&str>) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.pending.replace(tx).is_some() {
            tracing::warn!("[terminal:{}] read replaced an unfinished read", self.id);
        }
        inner.line.clear();
        inner.state = SessionState::Reading;
        if let Some(prompt) = prompt.filter(|_| self.echo) {
            self.emit(&mut inner, prompt);
        }
        while inner.state == SessionState::Reading {
            let Some(key) = inner.typeahead.pop_front() else {
                break;
            };
            self.key(&mut inner, key);
        }
        rx
    }

    /// Read one line. `None` if the session was torn down mid-read.
    pub async fn read(&self, prompt: Option<&str>) -> Option<String> {
        self.begin_read(prompt).await.ok()
    }

    /// Feed keystrokes. Those typed while no read is pending are held for
    /// the next one.
    pub fn input(&self, data: &str) {
        let mut inner = self.inner.lock();
        for key in data.chars() {
            if inner.state == SessionState::Reading {
                self.key(&mut inner, key);
            } else {
                inner.typeahead.push_back(key);
            }
        }
    }

    /// Keystrokes held for the next read.
    pub fn typeahead(&self) -> usize {
        self.inner.lock().typeahead.len()
    }

    fn key(&self, inner: &mut SessionInner, key: char) {
        match key {
            BACKSPACE => {
                if inner.line.pop().is_some() {
                    self.emit(inner, ERASE);
                }
            }
            ENTER => self.complete_line(inner),
            other => {
                inner.line.push(other);
                let mut buf = [0u8; 4];
                self.emit(inner, other.encode_utf8(&mut buf));
            }
        }
    }

    /// Type a whole line followed by enter.
    pub fn feed_line(&self, line: &str) {
        self.input(line);
        self.input("\r");
    }

    /// Program output. Queued while a line is being typed.
    pub fn write(&self, data: &str) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Reading {
            inner.queued.push_back(data.to_string());
            return;
        }
        self.emit(&mut inner, data);
    }

    fn complete_line(&self, inner: &mut SessionInner) {
        self.emit(inner, "\r\n");
        let line = std::mem::take(&mut inner.line);
        match inner.pending.take() {
            Some(slot) => {
                if slot.send(line).is_err() {
                    tracing::debug!("[terminal:{}] reader went away before the line completed", self.id);
                }
            }
            None => tracing::warn!("[terminal:{}] line completed with no reader", self.id),
        }
        inner.state = SessionState::Writing;
        while let Some(queued) = inner.queued.pop_front() {
            self.emit(inner, &queued);
        }
        inner.state = SessionState::Idle;
    }

    /// Write to the surface, turning a bare `\n` into `\r\n`.
    fn emit(&self, inner: &mut SessionInner, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut out = String::with_capacity(data.len() + 4);
        for c in data.chars() {
            if c == '\n' && !inner.after_cr {
                out.push('\r');
            }
            out.push(c);
            inner.after_cr = c == '\r';
        }
        self.surface.write(&out);
    }
}

/// Install the session's `read` and `write` handlers on a host channel,
/// replacing whatever handled them before.
pub fn bind(session: Arc<TerminalSession>, channel: &HostChannel) -> Result<(), ChannelError> {
    channel.unregister(methods::READ);
    channel.unregister(methods::WRITE);

    let reader = session.clone();
    channel.register(methods::READ, move |args: Vec<Value>| {
        let session = reader.clone();
        async move {
            let prompt = args.first().and_then(|v| v.as_str().map(str::to_string));
            session
                .read(prompt.as_deref())
                .await
                .map(Value::Str)
                .ok_or_else(|| RemoteError::new("EOFError", "terminal closed"))
        }
    })?;

    channel.register(methods::WRITE, move |args: Vec<Value>| {
        let session = session.clone();
        async move {
            let data = args
                .get(1)
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| RemoteError::new("TypeError", "write expects (stream, data)"))?;
            session.write(&data);
            Ok::<_, RemoteError>(Value::Null)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(echo: bool) -> (TerminalSession, MemorySurface) {
        let surface = MemorySurface::new();
        let descriptor = TerminalDescriptor::new("t1", Arc::new(surface.clone()));
        (TerminalSession::new(descriptor, echo), surface)
    }

    #[test]
    fn test_backspace_erases_and_noop_when_empty() {
        let (term, surface) = session(true);
        let _rx = term.begin_read(None);
        term.input("ab");
        assert_eq!(term.line(), "ab");
        surface.take();

        term.input("\x7f");
        assert_eq!(term.line(), "a");
        assert_eq!(surface.take(), ERASE);

        term.input("\x7f");
        assert_eq!(term.line(), "");
        assert_eq!(surface.take(), ERASE);

        term.input("\x7f");
        assert_eq!(term.line(), "");
        assert_eq!(surface.take(), "");
        assert_eq!(term.state(), SessionState::Reading);
    }

    #[tokio::test]
    async fn test_line_completion_resolves_read() {
        let (term, surface) = session(true);
        let rx = term.begin_read(Some("> "));
        term.input("h");
        term.input("i");
        term.input("\r");

        assert_eq!(rx.await.unwrap(), "hi");
        assert_eq!(term.line(), "");
        assert_eq!(term.state(), SessionState::Idle);
        assert_eq!(surface.contents(), "> hi\r\n");
    }

    #[test]
    fn test_writes_queued_while_reading() {
        let (term, surface) = session(false);
        let _rx = term.begin_read(Some("ignored"));
        term.input("x");
        term.write("first\n");
        term.write("second\n");
        assert_eq!(surface.contents(), "x");

        term.input("\r");
        assert_eq!(surface.contents(), "x\r\nfirst\r\nsecond\r\n");
        assert_eq!(term.state(), SessionState::Idle);
    }

    #[test]
    fn test_bare_newline_gets_carriage_return() {
        let (term, surface) = session(true);
        term.write("a\nb\r\nc");
        term.write("\r");
        term.write("\nd\n");
        assert_eq!(surface.contents(), "a\r\nb\r\nc\r\nd\r\n");
    }

    #[tokio::test]
    async fn test_keystrokes_before_a_read_are_held() {
        let (term, surface) = session(true);
        term.input("abc\r");
        assert_eq!(term.line(), "");
        assert_eq!(surface.contents(), "");
        assert_eq!(term.state(), SessionState::Idle);
        assert_eq!(term.typeahead(), 4);

        let rx = term.begin_read(Some("> "));
        assert_eq!(rx.await.unwrap(), "abc");
        assert_eq!(surface.contents(), "> abc\r\n");
        assert_eq!(term.typeahead(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_lines_reach_successive_reads() {
        let (term, surface) = session(false);
        let first = term.begin_read(None);
        term.feed_line("one");
        term.feed_line("two");
        assert_eq!(first.await.unwrap(), "one");
        assert_eq!(term.state(), SessionState::Idle);

        let second = term.begin_read(None);
        assert_eq!(second.await.unwrap(), "two");
        assert_eq!(term.state(), SessionState::Idle);
        assert_eq!(surface.contents(), "one\r\ntwo\r\n");

        // A partial line stays in progress for the read that picks it up.
        term.input("th");
        let _third = term.begin_read(None);
        assert_eq!(term.line(), "th");
        assert_eq!(term.state(), SessionState::Reading);
    }

    #[tokio::test]
    async fn test_feed_line() {
        let (term, _) = session(true);
        let rx = term.begin_read(None);
        term.feed_line("héllo");
        assert_eq!(rx.await.unwrap(), "héllo");
    }

    #[test]
    fn test_surface_sink_joins_split_characters() {
        let surface = MemorySurface::new();
        let mut sink = SurfaceSink::new(Arc::new(surface.clone()));
        for byte in "né".bytes() {
            sink.write_byte(byte).unwrap();
        }
        sink.write("!\n").unwrap();
        assert_eq!(surface.contents(), "né!\n");
    }
}
