//! Host endpoint of a call channel
//!
//! Calls return futures keyed by call id. A dispatcher task owns the inbound
//! queue: replies resolve the matching pending slot, and every inbound call
//! runs in its own task so a handler that waits (a terminal read, a sleep)
//! never holds up delivery of other messages, including the replies that
//! unblock nested calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tether_types::{decode, encode, HandleId, Value};
use tokio::sync::{mpsc, oneshot};

use crate::error::ChannelError;
use crate::link::HostLink;
use crate::message::{pack_args, unpack_args, CallId, Message, RemoteError, Target};
use crate::refs::RefTable;

/// Async handler for calls arriving from the worker.
pub type HostHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

type PendingSlot = oneshot::Sender<Result<Value, ChannelError>>;

/// Host endpoint. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct HostChannel {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    next_id: AtomicU64,
    closed: AtomicBool,
    tx: Mutex<Option<std_mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<CallId, PendingSlot>>,
    handlers: RwLock<HashMap<String, HostHandler>>,
    refs: Mutex<RefTable<HostHandler>>,
}

impl HostChannel {
    /// Bind a channel to the host end of a link and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, link: HostLink) -> Self {
        let HostLink { tx, rx } = link;
        let inner = Arc::new(Inner {
            name: name.into(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            refs: Mutex::new(RefTable::default()),
        });
        tokio::spawn(dispatch(inner.clone(), rx));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a handler for a method the worker may call.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), ChannelError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let method = method.into();
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&method) {
            return Err(ChannelError::HandlerExists(method));
        }
        let handler: HostHandler = Arc::new(move |args| handler(args).boxed());
        handlers.insert(method, handler);
        Ok(())
    }

    /// Register an already boxed handler.
    pub fn register_handler(&self, method: impl Into<String>, handler: HostHandler) -> Result<(), ChannelError> {
        let method = method.into();
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&method) {
            return Err(ChannelError::HandlerExists(method));
        }
        handlers.insert(method, handler);
        Ok(())
    }

    /// Remove a method handler. Returns `false` if none was registered.
    pub fn unregister(&self, method: &str) -> bool {
        self.inner.handlers.write().remove(method).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.inner.handlers.read().contains_key(method)
    }

    /// Expose a host callable to the worker as a handle.
    pub fn expose<F, Fut>(&self, handler: F) -> Value
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler: HostHandler = Arc::new(move |args| handler(args).boxed());
        Value::Handle(self.inner.refs.lock().insert(handler))
    }

    /// Drop an exposed handle.
    pub fn release(&self, handle: HandleId) -> bool {
        self.inner.refs.lock().remove(handle).is_some()
    }

    /// Call into the worker and wait for its reply.
    pub async fn call(&self, target: Target, args: Vec<Value>) -> Result<Value, ChannelError> {
        let args = pack_args(args)?;
        let id = CallId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (slot_tx, slot_rx) = oneshot::channel();

        // Register before sending so a fast reply always finds its slot.
        self.inner.pending.lock().insert(id, slot_tx);
        tracing::debug!("[channel:{}] call {} -> {}", self.inner.name, id, target);

        if !self.inner.send(Message::Call { id, target, args }) {
            self.inner.pending.lock().remove(&id);
            return Err(ChannelError::Closed);
        }

        slot_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Call a named worker method.
    pub async fn call_method(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError> {
        self.call(Target::method(method), args).await
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Close the channel. Every pending call fails with [`ChannelError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn send(&self, msg: Message) -> bool {
        match &*self.tx.lock() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn resolve(&self, id: CallId, outcome: Result<Value, ChannelError>) {
        match self.pending.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(outcome);
            }
            None => tracing::warn!("[channel:{}] reply for unknown call {}", self.name, id),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender disconnects the worker's receive loop.
        self.tx.lock().take();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            tracing::debug!(
                "[channel:{}] rejecting {} pending call(s) on close",
                self.name,
                pending.len()
            );
        }
        for (_, slot) in pending {
            let _ = slot.send(Err(ChannelError::Closed));
        }
    }

    fn handler_for(&self, target: &Target) -> Option<HostHandler> {
        match target {
            Target::Method(name) => self.handlers.read().get(name).cloned(),
            Target::Handle(id) => self.refs.lock().get(*id),
        }
    }

    async fn serve(&self, target: Target, args: tether_types::Wire) -> Result<Value, RemoteError> {
        let handler = self
            .handler_for(&target)
            .ok_or_else(|| RemoteError::new("NoHandler", format!("no host handler for {target}")))?;
        let args = unpack_args(&args).map_err(|e| RemoteError::new("TypeError", e.to_string()))?;
        handler(args).await
    }

    fn reply(&self, id: CallId, outcome: Result<Value, RemoteError>) {
        let msg = match outcome.and_then(|value| {
            encode(&value).map_err(|e| RemoteError::new("TypeError", e.to_string()))
        }) {
            Ok(value) => Message::Reply { id, value },
            Err(error) => Message::Fail { id, error },
        };
        if !self.send(msg) {
            tracing::debug!("[channel:{}] dropped reply {}: channel closed", self.name, id);
        }
    }
}

async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Reply { id, value } => {
                inner.resolve(id, decode(&value).map_err(ChannelError::from));
            }
            Message::Fail { id, error } => {
                inner.resolve(id, Err(ChannelError::Remote(error)));
            }
            Message::Call { id, target, args } => {
                tracing::debug!("[channel:{}] inbound {} <- {}", inner.name, id, target);
                let inner = inner.clone();
                tokio::spawn(async move {
                    let outcome = inner.serve(target, args).await;
                    inner.reply(id, outcome);
                });
            }
        }
    }
    tracing::debug!("[channel:{}] worker end closed", inner.name);
    inner.shutdown();
}
