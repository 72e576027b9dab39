//! Notification sink: makes a message visible to the end user.

use std::sync::Arc;

use parking_lot::Mutex;

pub trait Notify: Send + Sync {
    fn notify(&self, message: &str);
}

/// Logs notifications at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notify for TracingNotifier {
    fn notify(&self, message: &str) {
        tracing::error!("[notify] {}", message);
    }
}

/// Records notifications. Clones share the record.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Notify for MemoryNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
