//! Worker endpoint of a call channel
//!
//! The worker is a plain thread, so a call simply blocks it: after sending,
//! the caller pumps the inbound queue itself until its own reply shows up.
//! Calls arriving in the meantime are served inline on the same thread,
//! which is what lets a host handler call back into the worker while the
//! worker is still waiting on that very handler. Replies meant for an outer
//! frame of such a nested stack are stashed until that frame resumes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tether_types::{decode, encode, HandleId, NativeFunction, Value, Wire};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::link::WorkerLink;
use crate::message::{pack_args, unpack_args, CallId, Message, RemoteError, Target};
use crate::refs::RefTable;

/// Blocking handler for calls arriving from the host.
pub type WorkerHandler = Arc<dyn Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync>;

pub struct WorkerChannel {
    name: String,
    next_id: AtomicU64,
    closed: AtomicBool,
    depth: AtomicUsize,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Mutex<std_mpsc::Receiver<Message>>,
    handlers: RwLock<HashMap<String, WorkerHandler>>,
    refs: Mutex<RefTable<NativeFunction>>,
    outstanding: Mutex<HashSet<CallId>>,
    stash: Mutex<HashMap<CallId, Result<Value, ChannelError>>>,
}

impl WorkerChannel {
    pub fn new(name: impl Into<String>, link: WorkerLink) -> Arc<Self> {
        let WorkerLink { tx, rx } = link;
        Arc::new(Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            handlers: RwLock::new(HashMap::new()),
            refs: Mutex::new(RefTable::default()),
            outstanding: Mutex::new(HashSet::new()),
            stash: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler for a method the host may call.
    pub fn register<F>(&self, method: impl Into<String>, handler: F) -> Result<(), ChannelError>
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let method = method.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&method) {
            return Err(ChannelError::HandlerExists(method));
        }
        handlers.insert(method, Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    /// Put a live callable in the reference table so the host can call it.
    pub fn expose(&self, func: NativeFunction) -> Value {
        Value::Handle(self.refs.lock().insert(func))
    }

    pub fn release(&self, handle: HandleId) -> bool {
        self.refs.lock().remove(handle).is_some()
    }

    /// Call into the host, blocking this thread until the reply arrives.
    pub fn call(&self, target: Target, args: Vec<Value>) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let args = pack_args(args)?;
        let id = CallId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            "[channel:{}] call {} -> {} (depth {})",
            self.name,
            id,
            target,
            self.depth.load(Ordering::SeqCst)
        );

        self.outstanding.lock().insert(id);
        if !self.send(Message::Call { id, target, args }) {
            self.outstanding.lock().remove(&id);
            return Err(ChannelError::Closed);
        }

        self.depth.fetch_add(1, Ordering::SeqCst);
        let outcome = self.wait_for(id);
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.outstanding.lock().remove(&id);
        outcome
    }

    pub fn call_method(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError> {
        self.call(Target::method(method), args)
    }

    /// Serve inbound calls until the host closes the channel.
    pub fn serve(&self) {
        while let Some(msg) = self.recv() {
            match msg {
                Message::Call { id, target, args } => self.serve_call(id, target, args),
                other => self.stash_reply(other),
            }
        }
        tracing::debug!("[channel:{}] host end closed", self.name);
    }

    /// Stop sending to the host. Inbound calls already queued are dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tx.lock().take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────

    fn send(&self, msg: Message) -> bool {
        match &*self.tx.lock() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn recv(&self) -> Option<Message> {
        // The lock is released before the message is handled, so a nested
        // call made while handling it can take it again.
        let msg = self.rx.lock().recv().ok();
        if msg.is_none() {
            self.closed.store(true, Ordering::SeqCst);
        }
        msg
    }

    fn wait_for(&self, id: CallId) -> Result<Value, ChannelError> {
        loop {
            if let Some(outcome) = self.stash.lock().remove(&id) {
                return outcome;
            }
            let msg = self.recv().ok_or(ChannelError::Closed)?;
            match msg {
                Message::Reply { id: rid, value } if rid == id => {
                    return decode(&value).map_err(ChannelError::from);
                }
                Message::Fail { id: rid, error } if rid == id => {
                    return Err(ChannelError::Remote(error));
                }
                Message::Call {
                    id: cid,
                    target,
                    args,
                } => self.serve_call(cid, target, args),
                other => self.stash_reply(other),
            }
        }
    }

    fn stash_reply(&self, msg: Message) {
        let id = msg.id();
        if !self.outstanding.lock().contains(&id) {
            tracing::warn!("[channel:{}] reply for unknown call {}", self.name, id);
            return;
        }
        let outcome = match msg {
            Message::Reply { value, .. } => decode(&value).map_err(ChannelError::from),
            Message::Fail { error, .. } => Err(ChannelError::Remote(error)),
            Message::Call { .. } => return,
        };
        self.stash.lock().insert(id, outcome);
    }

    fn handler_for(&self, target: &Target) -> Option<WorkerHandler> {
        match target {
            Target::Method(name) => self.handlers.read().get(name).cloned(),
            Target::Handle(id) => self.refs.lock().get(*id).map(|func| {
                let handler: WorkerHandler = Arc::new(move |args| {
                    func.call(args).map_err(|e| RemoteError::new("Error", e))
                });
                handler
            }),
        }
    }

    fn serve_call(&self, id: CallId, target: Target, args: Wire) {
        tracing::debug!("[channel:{}] inbound {} <- {}", self.name, id, target);
        let outcome = match self.handler_for(&target) {
            Some(handler) => unpack_args(&args)
                .map_err(|e| RemoteError::new("TypeError", e.to_string()))
                .and_then(|args| handler(args)),
            None => Err(RemoteError::new(
                "NoHandler",
                format!("no worker handler for {target}"),
            )),
        };
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
