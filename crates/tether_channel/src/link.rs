//! Transport between one host and one worker
//!
//! The worker thread runs no async runtime, so its inbound queue is a plain
//! blocking `std::sync::mpsc` receiver. The host side receives on a tokio
//! queue so its dispatcher can await. Both queues preserve send order.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::message::Message;

/// Host end of a link.
pub struct HostLink {
    pub(crate) tx: std_mpsc::Sender<Message>,
    pub(crate) rx: mpsc::UnboundedReceiver<Message>,
}

/// Worker end of a link.
pub struct WorkerLink {
    pub(crate) tx: mpsc::UnboundedSender<Message>,
    pub(crate) rx: std_mpsc::Receiver<Message>,
}

/// Create a connected pair of link ends.
pub fn link_pair() -> (HostLink, WorkerLink) {
    let (to_worker_tx, to_worker_rx) = std_mpsc::channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
    (
        HostLink {
            tx: to_worker_tx,
            rx: to_host_rx,
        },
        WorkerLink {
            tx: to_host_tx,
            rx: to_worker_rx,
        },
    )
}

// Raw access, used by channel endpoints and by tests standing in for a peer.

impl HostLink {
    /// Send a message to the worker. Returns `false` once the worker end is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Receive the next message from the worker.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl WorkerLink {
    /// Send a message to the host. Returns `false` once the host end is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Block until the next message from the host, `None` once closed.
    pub fn recv(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    /// Like [`WorkerLink::recv`] but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.rx.recv_timeout(timeout).ok()
    }
}
