//! Worker contexts
//!
//! A worker is a dedicated OS thread holding one interpreter and the worker
//! end of a call channel. The thread bootstraps its own [`Environment`]
//! (role worker), reports readiness to the host, then serves host calls
//! until the channel closes. Worker death is fatal to its channel: every
//! call pending on the host side fails with `Closed`.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tether_channel::{
    methods, ChannelError, HostApi, HostHandler, HostProxy, RemoteError, Stream, WorkerChannel, WorkerLink,
    WorkerProxy,
};
use tether_types::{NativeFunction, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ConfigSource, Settings};
use crate::environment::{Environment, Plugin};
use crate::error::{RunError, WorkerError};
use crate::hooks::{Role, WorkerCode};
use crate::interpreter::{Interpreter, InterpreterFactory, Module};
use crate::lifecycle::{RunMode, RunScope};
use crate::stdio::{ChannelNotifier, ChannelOutput, ChannelStdin};
use crate::terminal::TerminalDescriptor;

/// Name of the native module installed into every worker interpreter.
pub const HOST_MODULE: &str = "tether";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Options for [`Environment::create_worker`].
#[derive(Default)]
pub struct WorkerOptions {
    /// Interpreter kind; the settings default when unset.
    pub interpreter: Option<String>,
    pub version: Option<String>,
    pub config: Option<ConfigSource>,
    /// Run mode of the main run; the settings default when unset.
    pub mode: Option<RunMode>,
    pub name: Option<String>,
    /// Attach a terminal before the main run starts.
    pub terminal: Option<TerminalDescriptor>,
    /// Extra host methods the worker may call by name.
    pub methods: Vec<(String, HostHandler)>,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interpreter(mut self, kind: impl Into<String>) -> Self {
        self.interpreter = Some(kind.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn config(mut self, config: ConfigSource) -> Self {
        self.config = Some(config);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn terminal(mut self, descriptor: TerminalDescriptor) -> Self {
        self.terminal = Some(descriptor);
        self
    }

    /// Add a host method callable from the worker.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        use futures::FutureExt;
        let handler: HostHandler = Arc::new(move |args| handler(args).boxed());
        self.methods.push((name.into(), handler));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Host-side handle to a running worker.
pub struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) name: String,
    pub(crate) env: Arc<Environment>,
    pub(crate) proxy: WorkerProxy,
    pub(crate) config: Value,
    pub(crate) main: Mutex<Option<JoinHandle<Result<Value, RunError>>>>,
    pub(crate) thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The call proxy into the worker.
    pub fn sync(&self) -> &WorkerProxy {
        &self.proxy
    }

    /// Parsed worker configuration.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Wait for the main run. `None` if it was already awaited.
    pub async fn finished(&self) -> Option<Result<Value, RunError>> {
        let main = self.main.lock().take()?;
        Some(match main.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("[worker:{}] main run task failed: {}", self.name, e);
                Err(RunError::Transport(ChannelError::Closed))
            }
        })
    }

    /// Another run through both lifecycles.
    pub async fn run(&self, code: &str, mode: RunMode) -> Result<Value, RunError> {
        self.env
            .drive_remote(&self.proxy, &self.config, &self.name, code, mode)
            .await
    }

    /// Close the channel and drop any attached terminal. The worker thread
    /// exits once it notices.
    pub fn terminate(&self) {
        if !self.proxy.channel().is_closed() {
            tracing::debug!("[worker:{}] terminating", self.name);
            self.proxy.channel().close();
        }
        self.env.forget_worker(self.id);
    }

    pub fn is_terminated(&self) -> bool {
        self.proxy.channel().is_closed()
    }

    /// Terminate and wait for the worker thread to exit.
    pub async fn join(&self) -> Result<(), WorkerError> {
        self.terminate();
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|_| WorkerError::ThreadPanic)?;
        joined.map_err(|_| {
            tracing::error!("[worker:{}] thread panicked", self.name);
            WorkerError::ThreadPanic
        })
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let name = self.name.clone();
        let reap = move || {
            if handle.join().is_err() {
                tracing::error!("[worker:{}] thread panicked", name);
            }
        };
        // The interpreter may be mid-run; never park a runtime thread on it.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(reap)),
            Err(_) => reap(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker thread
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a worker thread needs to set itself up.
pub(crate) struct Bootstrap {
    pub name: String,
    pub settings: Settings,
    pub worker_code: WorkerCode,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub factory: Arc<dyn InterpreterFactory>,
    pub version: Option<String>,
    pub config: Value,
}

type SharedInterpreter = Arc<Mutex<Box<dyn Interpreter>>>;

/// Spawn the worker thread. `ready` resolves once the interpreter exists
/// and the worker's `onReady` has fired.
pub(crate) fn spawn(
    boot: Bootstrap,
    link: WorkerLink,
) -> Result<(thread::JoinHandle<()>, oneshot::Receiver<Result<(), WorkerError>>), WorkerError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let name = boot.name.clone();
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        tracing::debug!("[worker:{}] thread started", name);
        let channel = WorkerChannel::new(name.clone(), link);
        match setup(boot, &channel) {
            Ok(()) => {
                let _ = ready_tx.send(Ok(()));
                channel.serve();
                // The run handlers own the interpreter, whose streams own
                // the channel.
                channel.unregister(methods::RUN);
                channel.unregister(methods::RUN_ASYNC);
            }
            Err(e) => {
                tracing::error!("[worker:{}] bootstrap failed: {}", name, e);
                let _ = ready_tx.send(Err(e));
            }
        }
        channel.close();
        tracing::debug!("[worker:{}] thread exiting", name);
    })?;
    Ok((handle, ready_rx))
}

fn setup(boot: Bootstrap, channel: &Arc<WorkerChannel>) -> Result<(), WorkerError> {
    let Bootstrap {
        name,
        settings,
        worker_code,
        plugins,
        factory,
        version,
        config,
    } = boot;

    let api: Arc<dyn HostApi> = Arc::new(HostProxy::new(channel.clone()));
    let env = Arc::new(
        Environment::builder(Role::Worker, settings)
            .notifier(Arc::new(ChannelNotifier::new(api.clone())))
            .interpreter(factory.clone())
            .build(),
    );

    // Code shipped from the host first, then this context's own plugins.
    env.hooks().install_worker_code(&worker_code)?;
    for plugin in &plugins {
        tracing::debug!("[worker:{}] installing plugin {}", name, plugin.name());
        env.install(plugin.as_ref())?;
    }

    let mut interpreter = factory.create(version.as_deref(), &config)?;
    interpreter.set_stdout(Box::new(ChannelOutput::new(api.clone(), Stream::Stdout)));
    interpreter.set_stderr(Box::new(ChannelOutput::new(api.clone(), Stream::Stderr)));
    interpreter.set_stdin(Box::new(ChannelStdin::new(api.clone())));
    interpreter.register_module(HOST_MODULE, host_module(api));
    tracing::info!(
        "[worker:{}] {} {} ready",
        name,
        interpreter.kind(),
        interpreter.version()
    );

    let boot_run = env.lifecycle().descriptor("<bootstrap>", RunMode::Sync);
    env.lifecycle()
        .ensure_ready(&boot_run, &mut RunScope::local(&mut *interpreter, &config));

    let interpreter: SharedInterpreter = Arc::new(Mutex::new(interpreter));
    let config = Arc::new(config);
    for mode in [RunMode::Sync, RunMode::Async] {
        let method = match mode {
            RunMode::Sync => methods::RUN,
            RunMode::Async => methods::RUN_ASYNC,
        };
        let env = env.clone();
        let interpreter = interpreter.clone();
        let config = config.clone();
        let name = name.clone();
        channel.register(method, move |args| {
            let code = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| RemoteError::new("TypeError", format!("{method} expects source text")))?;
            run_in_worker(&env, &interpreter, &config, &name, code, mode)
        })?;
    }
    Ok(())
}

fn run_in_worker(
    env: &Environment,
    interpreter: &SharedInterpreter,
    config: &Value,
    name: &str,
    code: &str,
    mode: RunMode,
) -> Result<Value, RemoteError> {
    // A host handler calling back into `run` while a run is in progress
    // would need the interpreter twice.
    let Some(mut guard) = interpreter.try_lock() else {
        return Err(RemoteError::new("RuntimeError", "interpreter is busy"));
    };
    let lifecycle = env.lifecycle();
    let run = lifecycle.descriptor(name, mode);
    tracing::debug!("[worker:{}] run {} ({})", name, run.id, mode);
    let mut scope = RunScope::local(&mut **guard, config);
    let outcome = match mode {
        RunMode::Sync => lifecycle.run(&run, &mut scope, code),
        RunMode::Async => futures::executor::block_on(lifecycle.run_async(&run, &mut scope, code)),
    };
    outcome.map_err(remote_error)
}

fn remote_error(err: RunError) -> RemoteError {
    match err {
        RunError::Execution(e) => RemoteError::new(e.kind, e.message),
        RunError::HookCode { phase, source } => {
            RemoteError::new("ConfigError", format!("{phase} hook code failed: {source}"))
        }
        RunError::Remote(e) => e,
        RunError::Transport(e) => RemoteError::new("ChannelError", e.to_string()),
    }
}

/// The native module exposing host services to interpreted code.
fn host_module(api: Arc<dyn HostApi>) -> Module {
    let sleep = api.clone();
    let notify = api.clone();
    let permission = api.clone();
    let custom = api;
    Module::new()
        .with_function(NativeFunction::new("sleep", move |args| {
            let millis = args.first().and_then(Value::as_int).unwrap_or(0).max(0);
            sleep
                .sleep(Duration::from_millis(millis as u64))
                .map(|_| Value::Null)
                .map_err(|e| e.to_string())
        }))
        .with_function(NativeFunction::new("notify", move |args| {
            let message = join_args(&args);
            notify.notify(&message).map(|_| Value::Null).map_err(|e| e.to_string())
        }))
        .with_function(NativeFunction::new("request_permission", move |args| {
            let resource = args.first().map(Value::to_string).unwrap_or_default();
            permission
                .request_permission(&resource)
                .map(Value::Bool)
                .map_err(|e| e.to_string())
        }))
        .with_function(NativeFunction::new("call", move |mut args| {
            if args.is_empty() {
                return Err("call expects a method name".to_string());
            }
            let method = args.remove(0).to_string();
            custom.call_custom(&method, args).map_err(|e| e.to_string())
        }))
}

fn join_args(args: &[Value]) -> String {
    args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ")
}
