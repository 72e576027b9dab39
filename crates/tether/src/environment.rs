//! Environment
//!
//! One per execution context. Owns everything that would otherwise be a
//! process global: the hook registry, the lifecycle gate, the interpreter
//! factories, the notification sink and, on the host, the set of workers
//! that already have a terminal attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tether_channel::{link_pair, methods, ChannelError, HostChannel, RemoteError, WorkerProxy};
use tether_types::Value;

use crate::config::{parse_config, ConfigFormat, ConfigSource, Settings};
use crate::error::{HookError, RunError, StorageError, WorkerError};
use crate::fetch::{FileFetch, SourceFetch, SourceRef};
use crate::hooks::{Hook, Hooks, Phase, Role};
use crate::interpreter::{Interpreter, InterpreterFactory, ShellFactory};
use crate::lifecycle::{Lifecycle, RunMode, RunScope};
use crate::notify::{Notify, TracingNotifier};
use crate::storage::Storage;
use crate::terminal::{self, StdoutSurface, Surface, SurfaceSink, TerminalDescriptor, TerminalSession};
use crate::worker::{self, Bootstrap, WorkerHandle, WorkerId, WorkerOptions};

/// Host methods backed by [`Storage`].
pub mod storage_methods {
    pub const GET: &str = "storage.get";
    pub const SET: &str = "storage.set";
    pub const DELETE: &str = "storage.delete";
    pub const KEYS: &str = "storage.keys";
    pub const SYNC: &str = "storage.sync";
}

/// A bundle of hooks. Installed into every context that should carry it;
/// the plugin looks at [`Environment::role`] to decide what to register.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, env: &Environment) -> Result<(), HookError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct EnvironmentBuilder {
    role: Role,
    settings: Settings,
    notifier: Option<Arc<dyn Notify>>,
    fetch: Option<Arc<dyn SourceFetch>>,
    output: Option<Arc<dyn Surface>>,
    storage: Option<Storage>,
    factories: Vec<Arc<dyn InterpreterFactory>>,
}

impl EnvironmentBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notify>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn fetch(mut self, fetch: Arc<dyn SourceFetch>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Where worker output goes while no terminal is attached.
    pub fn output(mut self, output: Arc<dyn Surface>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn interpreter(mut self, factory: Arc<dyn InterpreterFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn build(self) -> Environment {
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let hooks = Arc::new(Hooks::new(self.role, self.settings.role_policy));
        let lifecycle = Lifecycle::new(hooks.clone(), notifier.clone(), self.settings.after_run_order);
        let factories = DashMap::new();
        for factory in self.factories {
            factories.insert(factory.kind().to_string(), factory);
        }
        tracing::debug!("[env:{}] created", self.role);
        Environment {
            role: self.role,
            settings: self.settings,
            hooks,
            lifecycle,
            notifier,
            fetch: self.fetch.unwrap_or_else(|| Arc::new(FileFetch::new())),
            output: self.output.unwrap_or_else(|| Arc::new(StdoutSurface)),
            storage: self.storage.map(|s| Arc::new(Mutex::new(s))),
            factories,
            worker_plugins: RwLock::new(Vec::new()),
            terminals: DashMap::new(),
            next_worker: AtomicU64::new(1),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment
// ─────────────────────────────────────────────────────────────────────────────

pub struct Environment {
    role: Role,
    settings: Settings,
    hooks: Arc<Hooks>,
    lifecycle: Lifecycle,
    notifier: Arc<dyn Notify>,
    fetch: Arc<dyn SourceFetch>,
    output: Arc<dyn Surface>,
    storage: Option<Arc<Mutex<Storage>>>,
    factories: DashMap<String, Arc<dyn InterpreterFactory>>,
    worker_plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    /// Workers that already have a terminal attached.
    terminals: DashMap<WorkerId, Arc<TerminalSession>>,
    next_worker: AtomicU64,
}

impl Environment {
    /// Start building an environment. The shell interpreter is always
    /// available.
    pub fn builder(role: Role, settings: Settings) -> EnvironmentBuilder {
        EnvironmentBuilder {
            role,
            settings,
            notifier: None,
            fetch: None,
            output: None,
            storage: None,
            factories: vec![Arc::new(ShellFactory)],
        }
    }

    /// A host environment with default collaborators.
    pub fn host(settings: Settings) -> Arc<Self> {
        Arc::new(Self::builder(Role::Host, settings).build())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn notifier(&self) -> &Arc<dyn Notify> {
        &self.notifier
    }

    pub fn storage(&self) -> Option<&Arc<Mutex<Storage>>> {
        self.storage.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hooks and plugins
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_hook(&self, role: Role, phase: Phase, hook: impl Into<Hook>) -> Result<bool, HookError> {
        self.hooks.register(role, phase, hook)
    }

    pub fn unregister_hook(&self, role: Role, phase: Phase, hook: &Hook) -> Result<bool, HookError> {
        self.hooks.unregister(role, phase, hook)
    }

    /// Install a plugin into this context.
    pub fn install(&self, plugin: &dyn Plugin) -> Result<(), HookError> {
        plugin.install(self)
    }

    /// Install a plugin into this context and into every worker created
    /// from now on, inside the worker's own context.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), HookError> {
        plugin.install(self)?;
        self.add_worker_plugin(plugin);
        Ok(())
    }

    /// Install a plugin into every worker created from now on.
    pub fn add_worker_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.worker_plugins.write();
        if !plugins.iter().any(|p| Arc::ptr_eq(p, &plugin)) {
            plugins.push(plugin);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Interpreters
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_interpreter(&self, factory: Arc<dyn InterpreterFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn interpreter_factory(&self, kind: &str) -> Option<Arc<dyn InterpreterFactory>> {
        self.factories.get(kind).map(|f| f.value().clone())
    }

    /// An interpreter for runs in this context, writing to the output surface.
    pub fn create_interpreter(
        &self,
        kind: &str,
        version: Option<&str>,
        config: &Value,
    ) -> Result<Box<dyn Interpreter>, WorkerError> {
        let factory = self
            .interpreter_factory(kind)
            .ok_or_else(|| WorkerError::UnknownInterpreter(kind.to_string()))?;
        let mut interpreter = factory.create(version, config)?;
        interpreter.set_stdout(Box::new(SurfaceSink::new(self.output.clone())));
        interpreter.set_stderr(Box::new(SurfaceSink::new(self.output.clone())));
        Ok(interpreter)
    }

    /// Run code in a local interpreter through this context's lifecycle.
    pub fn run_local(
        &self,
        interpreter: &mut (dyn Interpreter + 'static),
        source: &str,
        code: &str,
        config: &Value,
    ) -> Result<Value, RunError> {
        let run = self.lifecycle.descriptor(source, RunMode::Sync);
        self.lifecycle
            .run(&run, &mut RunScope::local(interpreter, config), code)
    }

    pub async fn run_local_async(
        &self,
        interpreter: &mut (dyn Interpreter + 'static),
        source: &str,
        code: &str,
        config: &Value,
    ) -> Result<Value, RunError> {
        let run = self.lifecycle.descriptor(source, RunMode::Async);
        self.lifecycle
            .run_async(&run, &mut RunScope::local(interpreter, config), code)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────

    /// Start a worker running `source`.
    ///
    /// Returns once the worker is ready. The main run proceeds in the
    /// background; [`WorkerHandle::finished`] waits for it.
    pub async fn create_worker(
        self: &Arc<Self>,
        source: SourceRef,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, WorkerError> {
        match self.start_worker(source, options).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.notifier.notify(&format!("Failed to start worker: {e}"));
                Err(e)
            }
        }
    }

    async fn start_worker(
        self: &Arc<Self>,
        source: SourceRef,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, WorkerError> {
        let code = source.load(self.fetch.as_ref()).await?;
        let config = self.resolve_config(options.config).await?;
        let kind = options
            .interpreter
            .unwrap_or_else(|| self.settings.interpreter.clone());
        let factory = self
            .interpreter_factory(&kind)
            .ok_or(WorkerError::UnknownInterpreter(kind))?;

        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::SeqCst));
        let name = options.name.unwrap_or_else(|| id.to_string());
        let mode = options.mode.unwrap_or(self.settings.run_mode);
        tracing::info!("[env:{}] starting {} for {}", self.role, name, source.label());

        let (host_link, worker_link) = link_pair();
        let channel = HostChannel::new(name.clone(), host_link);
        self.install_host_methods(&channel)?;
        for (method, handler) in options.methods {
            channel.register_handler(method, handler)?;
        }

        let boot = Bootstrap {
            name: name.clone(),
            settings: self.settings.clone(),
            worker_code: self.hooks.worker_code(),
            plugins: self.worker_plugins.read().clone(),
            factory,
            version: options.version,
            config: config.clone(),
        };
        let (thread, ready) = worker::spawn(boot, worker_link)?;

        // From here on, dropping the handle tears the worker down.
        let handle = WorkerHandle {
            id,
            name,
            env: self.clone(),
            proxy: WorkerProxy::new(channel.clone()),
            config,
            main: Mutex::new(None),
            thread: Mutex::new(Some(thread)),
        };
        ready.await.map_err(|_| WorkerError::ThreadPanic)??;

        if let Some(descriptor) = options.terminal {
            self.attach(id, &channel, descriptor)?;
        }

        let env = self.clone();
        let proxy = handle.proxy.clone();
        let run_config = handle.config.clone();
        let label = source.label().to_string();
        let main = tokio::spawn(async move {
            env.drive_remote(&proxy, &run_config, &label, &code, mode)
                .await
        });
        *handle.main.lock() = Some(main);
        Ok(handle)
    }

    async fn resolve_config(&self, source: Option<ConfigSource>) -> Result<Value, WorkerError> {
        Ok(match source {
            None => Value::Null,
            Some(ConfigSource::Value(value)) => value,
            Some(ConfigSource::Inline { text, format }) => {
                let format = format.unwrap_or_else(|| ConfigFormat::detect(&text));
                parse_config(&text, format, None)?
            }
            Some(ConfigSource::Url(url)) => {
                let text = self.fetch.fetch(&url).await?;
                let format = ConfigFormat::from_url(&url).unwrap_or_else(|| ConfigFormat::detect(&text));
                parse_config(&text, format, Some(&url))?
            }
        })
    }

    /// One run on the host side: host phases around the worker's own run.
    pub(crate) async fn drive_remote(
        &self,
        proxy: &WorkerProxy,
        config: &Value,
        source: &str,
        code: &str,
        mode: RunMode,
    ) -> Result<Value, RunError> {
        let lifecycle = &self.lifecycle;
        let run = lifecycle.descriptor(source, mode);
        let mut scope = RunScope::remote(proxy, config);
        lifecycle.ensure_ready_async(&run, &mut scope).await;

        match mode {
            RunMode::Sync => {
                lifecycle.before_run(&run, &mut scope)?;
                let outcome = proxy.run(code).await.map_err(RunError::from);
                if let Err(e) = &outcome {
                    lifecycle.report(e);
                }
                lifecycle.after_run(&run, &mut scope, outcome)
            }
            RunMode::Async => {
                lifecycle.before_run_async(&run, &mut scope).await?;
                let outcome = proxy.run_async(code).await.map_err(RunError::from);
                if let Err(e) = &outcome {
                    lifecycle.report(e);
                }
                lifecycle.after_run_async(&run, &mut scope, outcome).await
            }
        }
    }

    /// Default host methods every worker can call.
    fn install_host_methods(&self, channel: &HostChannel) -> Result<(), ChannelError> {
        channel.register(methods::SLEEP, |args: Vec<Value>| async move {
            let millis = args.first().and_then(Value::as_int).unwrap_or(0).max(0);
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
            Ok::<_, RemoteError>(Value::Null)
        })?;

        let settings = self.settings.clone();
        let role = self.role;
        channel.register(methods::REQUEST_PERMISSION, move |args: Vec<Value>| {
            let resource = args.first().map(Value::to_string).unwrap_or_default();
            let granted = settings.permits(&resource);
            tracing::info!(
                "[env:{}] permission for {} {}",
                role,
                resource,
                if granted { "granted" } else { "denied" }
            );
            async move { Ok::<_, RemoteError>(Value::Bool(granted)) }
        })?;

        let notifier = self.notifier.clone();
        channel.register(methods::NOTIFY, move |args: Vec<Value>| {
            let message = args.first().map(Value::to_string).unwrap_or_default();
            notifier.notify(&message);
            async { Ok::<_, RemoteError>(Value::Null) }
        })?;

        let output = self.output.clone();
        channel.register(methods::WRITE, move |args: Vec<Value>| {
            let data = args.get(1).map(Value::to_string).unwrap_or_default();
            output.write(&data);
            async { Ok::<_, RemoteError>(Value::Null) }
        })?;

        channel.register(methods::READ, |_| async {
            Err::<Value, _>(RemoteError::new("OSError", "stdin is not attached to a terminal"))
        })?;

        if let Some(storage) = &self.storage {
            install_storage_methods(channel, storage)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Terminals
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a terminal to a worker. Only the first attach per worker takes
    /// effect; later ones return `false`.
    pub fn attach_terminal(&self, worker: &WorkerHandle, descriptor: TerminalDescriptor) -> Result<bool, ChannelError> {
        Ok(self
            .attach(worker.id(), worker.sync().channel(), descriptor)?
            .is_some())
    }

    /// The terminal session attached to a worker, if any.
    pub fn terminal(&self, worker: WorkerId) -> Option<Arc<TerminalSession>> {
        self.terminals.get(&worker).map(|s| s.value().clone())
    }

    /// Drop what this environment keeps for a terminated worker.
    pub(crate) fn forget_worker(&self, id: WorkerId) {
        if let Some((_, session)) = self.terminals.remove(&id) {
            tracing::debug!("[env:{}] terminal {} detached from {}", self.role, session.id(), id);
        }
    }

    fn attach(
        &self,
        id: WorkerId,
        channel: &HostChannel,
        descriptor: TerminalDescriptor,
    ) -> Result<Option<Arc<TerminalSession>>, ChannelError> {
        match self.terminals.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!("[env:{}] {} already has a terminal", self.role, id);
                Ok(None)
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(TerminalSession::new(descriptor, self.settings.terminal.echo));
                terminal::bind(session.clone(), channel)?;
                tracing::debug!("[env:{}] terminal {} attached to {}", self.role, session.id(), id);
                slot.insert(session.clone());
                Ok(Some(session))
            }
        }
    }
}

fn install_storage_methods(channel: &HostChannel, storage: &Arc<Mutex<Storage>>) -> Result<(), ChannelError> {
    fn key(args: &[Value]) -> Result<String, RemoteError> {
        args.first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::new("TypeError", "storage key must be a string"))
    }
    fn failed(e: StorageError) -> RemoteError {
        RemoteError::new("OSError", e.to_string())
    }

    let store = storage.clone();
    channel.register(storage_methods::GET, move |args: Vec<Value>| {
        let result = key(&args)
            .and_then(|k| store.lock().get(&k).map_err(failed))
            .map(|v| v.unwrap_or(Value::Null));
        async move { result }
    })?;

    let store = storage.clone();
    channel.register(storage_methods::SET, move |args: Vec<Value>| {
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        let result = key(&args)
            .and_then(|k| store.lock().set(&k, &value).map_err(failed))
            .map(|_| Value::Null);
        async move { result }
    })?;

    let store = storage.clone();
    channel.register(storage_methods::DELETE, move |args: Vec<Value>| {
        let result = key(&args).map(|k| Value::Bool(store.lock().delete(&k)));
        async move { result }
    })?;

    let store = storage.clone();
    channel.register(storage_methods::KEYS, move |_| {
        let keys = store.lock().keys();
        async move { Ok::<_, RemoteError>(Value::list(keys.into_iter().map(Value::Str))) }
    })?;

    let store = storage.clone();
    channel.register(storage_methods::SYNC, move |_| {
        let store = store.clone();
        async move {
            // The only call that touches the disk.
            tokio::task::spawn_blocking(move || store.lock().sync())
                .await
                .map_err(|e| RemoteError::new("OSError", e.to_string()))?
                .map(|_| Value::Null)
                .map_err(failed)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Callback;
    use crate::interpreter::SHELL_KIND;
    use crate::notify::MemoryNotifier;
    use crate::terminal::MemorySurface;

    fn host() -> (Arc<Environment>, MemoryNotifier, MemorySurface) {
        let notifier = MemoryNotifier::new();
        let surface = MemorySurface::new();
        let env = Environment::builder(Role::Host, Settings::default())
            .notifier(Arc::new(notifier.clone()))
            .output(Arc::new(surface.clone()))
            .build();
        (Arc::new(env), notifier, surface)
    }

    #[test]
    fn test_local_run_writes_to_output() {
        let (env, _, surface) = host();
        env.register_hook(Role::Host, Phase::CodeBeforeRun, "set who plugin").unwrap();
        let mut interpreter = env.create_interpreter(SHELL_KIND, None, &Value::Null).unwrap();
        env.run_local(&mut *interpreter, "<inline>", "print hi $who", &Value::Null)
            .unwrap();
        assert_eq!(surface.contents(), "hi plugin\n");
    }

    #[test]
    fn test_unknown_interpreter() {
        let (env, _, _) = host();
        assert!(matches!(
            env.create_interpreter("cobol", None, &Value::Null),
            Err(WorkerError::UnknownInterpreter(k)) if k == "cobol"
        ));
    }

    struct CountingPlugin;

    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }

        fn install(&self, env: &Environment) -> Result<(), HookError> {
            if env.role() == Role::Worker {
                env.register_hook(Role::Worker, Phase::CodeBeforeRun, "print from plugin")?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_worker_plugins_are_deduplicated() {
        let (env, _, _) = host();
        let plugin: Arc<dyn Plugin> = Arc::new(CountingPlugin);
        env.add_plugin(plugin.clone()).unwrap();
        env.add_worker_plugin(plugin);
        assert_eq!(env.worker_plugins.read().len(), 1);
        // The host half of the plugin registers nothing.
        assert!(env.hooks().fragments(Phase::CodeBeforeRun).is_empty());
    }

    #[tokio::test]
    async fn test_worker_startup_failure_is_notified() {
        let (env, notifier, _) = host();
        let err = env
            .create_worker(
                SourceRef::inline("print hi"),
                WorkerOptions::new().config(ConfigSource::Inline {
                    text: "{ broken".to_string(),
                    format: None,
                }),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Config(_)));
        assert_eq!(notifier.messages().len(), 1);

        let err = env
            .create_worker(SourceRef::inline("print hi"), WorkerOptions::new().interpreter("nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::UnknownInterpreter(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_runs_with_host_phases() {
        let (env, _, surface) = host();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (phase, tag) in [(Phase::OnReady, "ready"), (Phase::OnBeforeRun, "before"), (Phase::OnAfterRun, "after")] {
            let order = order.clone();
            env.register_hook(
                Role::Host,
                phase,
                Callback::new(tag, move |ctx| {
                    assert!(ctx.worker.is_some());
                    order.lock().push(tag);
                    Ok(())
                }),
            )
            .unwrap();
        }
        env.register_hook(Role::Worker, Phase::CodeBeforeRun, "set who shipped").unwrap();

        let handle = env
            .create_worker(SourceRef::inline("print hello $who"), WorkerOptions::new())
            .await
            .unwrap();
        handle.finished().await.unwrap().unwrap();
        assert_eq!(surface.contents(), "hello shipped\n");
        assert_eq!(*order.lock(), vec!["ready", "before", "after"]);

        // A second run skips onReady.
        handle.run("print again", RunMode::Sync).await.unwrap();
        assert_eq!(*order.lock(), vec!["ready", "before", "after", "before", "after"]);
        handle.join().await.unwrap();
    }
}
