//! Worker-side standard streams over the call channel.

use std::io;
use std::sync::Arc;

use tether_channel::{ChannelError, HostApi, Stream};

use crate::interpreter::{InputSource, OutputSink};
use crate::notify::Notify;

fn io_error(e: ChannelError) -> io::Error {
    match e {
        ChannelError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, e),
        other => io::Error::other(other),
    }
}

/// An output stream forwarded to the host's `write`. Whole-buffer writes go
/// out as they are; single bytes are collected up to the next newline.
pub struct ChannelOutput {
    api: Arc<dyn HostApi>,
    stream: Stream,
    buf: Vec<u8>,
}

impl ChannelOutput {
    pub fn new(api: Arc<dyn HostApi>, stream: Stream) -> Self {
        Self {
            api,
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&self, data: &str) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.api.write(self.stream, data).map_err(io_error)
    }

    /// Send buffered bytes, holding back a multi-byte character that is
    /// still incomplete.
    fn drain(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let (text, rest) = match std::str::from_utf8(&self.buf) {
            Ok(text) => (text.to_string(), Vec::new()),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                (
                    String::from_utf8_lossy(&self.buf[..valid]).into_owned(),
                    self.buf[valid..].to_vec(),
                )
            }
            Err(_) => (String::from_utf8_lossy(&self.buf).into_owned(), Vec::new()),
        };
        self.buf = rest;
        self.send(&text)
    }
}

impl OutputSink for ChannelOutput {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.drain()?;
        self.send(data)
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.buf.push(byte);
        if byte == b'\n' {
            self.drain()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

impl Drop for ChannelOutput {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            tracing::debug!("[stdio] dropped {} bytes of {}: {}", self.buf.len(), self.stream, e);
        }
    }
}

/// Standard input served by the host's `read`. A host-side `EOFError` is
/// end of input.
pub struct ChannelStdin {
    api: Arc<dyn HostApi>,
}

impl ChannelStdin {
    pub fn new(api: Arc<dyn HostApi>) -> Self {
        Self { api }
    }
}

impl InputSource for ChannelStdin {
    fn read_line(&mut self, prompt: Option<&str>) -> io::Result<Option<String>> {
        match self.api.read(prompt) {
            Ok(line) => Ok(Some(line)),
            Err(ChannelError::Remote(e)) if e.kind == "EOFError" => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }
}

/// Worker notifications, shown by the host.
pub struct ChannelNotifier {
    api: Arc<dyn HostApi>,
}

impl ChannelNotifier {
    pub fn new(api: Arc<dyn HostApi>) -> Self {
        Self { api }
    }
}

impl Notify for ChannelNotifier {
    fn notify(&self, message: &str) {
        if let Err(e) = self.api.notify(message) {
            tracing::warn!("[stdio] notification lost ({}): {}", e, message);
        }
    }
}
