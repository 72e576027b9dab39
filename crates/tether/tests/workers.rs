//! End-to-end runs through real worker threads.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tether::{
    AfterRunOrder, Callback, ChannelError, ConfigSource, Environment, HookError, MemoryNotifier, MemorySurface,
    Phase, Plugin, Role, RunError, RunMode, Settings, SourceRef, Storage, TerminalDescriptor, Value,
    WorkerOptions,
};
use tether::interpreter::{InputSource, Interpreter, InterpreterError, InterpreterFactory, Module, OutputSink};
use tether::terminal::SessionState;

struct Host {
    env: Arc<Environment>,
    notes: MemoryNotifier,
    out: MemorySurface,
}

fn host_with(settings: Settings) -> Host {
    let notes = MemoryNotifier::new();
    let out = MemorySurface::new();
    let env = Environment::builder(Role::Host, settings)
        .notifier(Arc::new(notes.clone()))
        .output(Arc::new(out.clone()))
        .build();
    Host {
        env: Arc::new(env),
        notes,
        out,
    }
}

fn host() -> Host {
    host_with(Settings::default())
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// Logs every callback phase, in whichever context it is installed.
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn install(&self, env: &Environment) -> Result<(), HookError> {
        let role = env.role();
        for phase in [
            Phase::OnReady,
            Phase::OnBeforeRun,
            Phase::OnBeforeRunAsync,
            Phase::OnAfterRun,
            Phase::OnAfterRunAsync,
        ] {
            let log = self.log.clone();
            env.register_hook(
                role,
                phase,
                Callback::new(format!("{role}:{phase}"), move |ctx| {
                    log.lock().push(format!("{}:{}", ctx.role, ctx.phase));
                    Ok(())
                }),
            )?;
        }
        Ok(())
    }
}

/// Worker-only hooks that print through the worker's interpreter.
struct Printer;

impl Plugin for Printer {
    fn name(&self) -> &str {
        "printer"
    }

    fn install(&self, env: &Environment) -> Result<(), HookError> {
        if env.role() != Role::Worker {
            return Ok(());
        }
        env.register_hook(Role::Worker, Phase::CodeBeforeRun, "print code-before")?;
        env.register_hook(Role::Worker, Phase::CodeAfterRun, "print code-after")?;
        for (phase, line) in [(Phase::OnBeforeRun, "print cb-before"), (Phase::OnAfterRun, "print cb-after")] {
            env.register_hook(
                Role::Worker,
                phase,
                Callback::new(line, move |ctx| {
                    if let Some(interpreter) = ctx.interpreter.as_deref_mut() {
                        interpreter.run(line)?;
                    }
                    Ok(())
                }),
            )?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callbacks_fire_in_order_across_contexts() {
    let h = host();
    let log = Arc::new(Mutex::new(Vec::new()));
    h.env.add_plugin(Arc::new(Recorder { log: log.clone() })).unwrap();

    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "worker:onReady",
            "host:onReady",
            "host:onBeforeRun",
            "worker:onBeforeRun",
            "worker:onAfterRun",
            "host:onAfterRun",
        ]
    );
    assert_eq!(h.out.contents(), "user\n");
    worker.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_runs_use_async_phases() {
    let h = host();
    let log = Arc::new(Mutex::new(Vec::new()));
    h.env.add_plugin(Arc::new(Recorder { log: log.clone() })).unwrap();

    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new().mode(RunMode::Async))
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "worker:onReady",
            "host:onReady",
            "host:onBeforeRunAsync",
            "worker:onBeforeRunAsync",
            "worker:onAfterRunAsync",
            "host:onAfterRunAsync",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_phase_order_around_user_code() {
    let h = host();
    h.env.add_worker_plugin(Arc::new(Printer));
    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(h.out.contents(), "code-before\ncb-before\nuser\ncb-after\ncode-after\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_after_run_order_setting_reaches_worker() {
    let h = host_with(Settings {
        after_run_order: AfterRunOrder::CodeFirst,
        ..Settings::default()
    });
    h.env.add_worker_plugin(Arc::new(Printer));
    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(h.out.contents(), "code-before\ncb-before\nuser\ncode-after\ncb-after\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_hooks_fire_once() {
    let h = host();
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    let cb = Callback::new("count", move |_| {
        *counter.lock() += 1;
        Ok(())
    });
    assert!(h.env.register_hook(Role::Host, Phase::OnBeforeRun, cb.clone()).unwrap());
    assert!(!h.env.register_hook(Role::Host, Phase::OnBeforeRun, cb).unwrap());
    assert!(h.env.register_hook(Role::Worker, Phase::CodeBeforeRun, "print shipped").unwrap());
    assert!(!h.env.register_hook(Role::Worker, Phase::CodeBeforeRun, "print shipped").unwrap());

    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(*count.lock(), 1);
    assert_eq!(h.out.contents(), "shipped\nuser\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reregistered_callback_fires_again() {
    let h = host();
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    let cb = Callback::new("count", move |_| {
        *counter.lock() += 1;
        Ok(())
    });
    h.env.register_hook(Role::Host, Phase::OnBeforeRun, cb.clone()).unwrap();

    let worker = h
        .env
        .create_worker(SourceRef::inline("print one"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(*count.lock(), 1);

    assert!(h
        .env
        .unregister_hook(Role::Host, Phase::OnBeforeRun, &cb.clone().into())
        .unwrap());
    worker.run("print two", RunMode::Sync).await.unwrap();
    assert_eq!(*count.lock(), 1);

    assert!(h.env.register_hook(Role::Host, Phase::OnBeforeRun, cb).unwrap());
    worker.run("print three", RunMode::Sync).await.unwrap();
    assert_eq!(*count.lock(), 2);
    assert_eq!(h.out.contents(), "one\ntwo\nthree\n");
}

struct Flaky;

impl Plugin for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn install(&self, env: &Environment) -> Result<(), HookError> {
        env.register_hook(
            Role::Worker,
            Phase::OnBeforeRun,
            Callback::new("bad", |_| anyhow::bail!("no luck")),
        )?;
        env.register_hook(
            Role::Worker,
            Phase::OnBeforeRun,
            Callback::new("worse", |_| panic!("boom")),
        )?;
        env.register_hook(
            Role::Worker,
            Phase::OnBeforeRun,
            Callback::new("good", |ctx| {
                if let Some(interpreter) = ctx.interpreter.as_deref_mut() {
                    interpreter.run("print still here")?;
                }
                Ok(())
            }),
        )?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_worker_callbacks_do_not_stop_the_run() {
    let h = host();
    h.env.add_worker_plugin(Arc::new(Flaky));
    let worker = h
        .env
        .create_worker(SourceRef::inline("print user"), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();

    assert_eq!(h.out.contents(), "still here\nuser\n");
    let notes = h.notes.messages();
    assert_eq!(notes.len(), 2);
    assert!(notes[0].contains("'bad'") && notes[0].contains("no luck"));
    assert!(notes[1].contains("'worse'"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_error_surfaces_once() {
    let h = host();
    let after = Arc::new(Mutex::new(0));
    let seen = after.clone();
    h.env
        .register_hook(
            Role::Host,
            Phase::OnAfterRun,
            Callback::new("after", move |_| {
                *seen.lock() += 1;
                Ok(())
            }),
        )
        .unwrap();

    let worker = h
        .env
        .create_worker(SourceRef::inline("print start\nfail ValueError bad thing\nprint unreachable"), WorkerOptions::new())
        .await
        .unwrap();
    match worker.finished().await.unwrap() {
        Err(RunError::Remote(e)) => {
            assert_eq!(e.kind, "ValueError");
            assert_eq!(e.message, "bad thing");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.out.contents(), "start\n");
    assert_eq!(h.notes.messages(), vec!["ValueError: bad thing".to_string()]);
    assert_eq!(*after.lock(), 1);

    // The worker survives a failed run.
    worker.run("print again", RunMode::Sync).await.unwrap();
    assert_eq!(h.out.contents(), "start\nagain\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_seeds_interpreter() {
    let h = host();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.json");
    std::fs::write(&path, r#"{"vars": {"who": "json"}}"#).unwrap();

    let inline = h
        .env
        .create_worker(
            SourceRef::inline("print hi $who"),
            WorkerOptions::new().config(ConfigSource::Inline {
                text: "[vars]\nwho = \"toml\"\n".to_string(),
                format: None,
            }),
        )
        .await
        .unwrap();
    inline.finished().await.unwrap().unwrap();
    assert_eq!(inline.config().get("vars").and_then(|v| v.get("who")), Some(Value::str("toml")));

    let fetched = h
        .env
        .create_worker(
            SourceRef::inline("print hi $who"),
            WorkerOptions::new().config(ConfigSource::Url(format!("file://{}", path.display()))),
        )
        .await
        .unwrap();
    fetched.finished().await.unwrap().unwrap();
    assert_eq!(h.out.contents(), "hi toml\nhi json\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permission_requests_follow_settings() {
    let h = host_with(Settings {
        permissions: vec!["net:".to_string()],
        ..Settings::default()
    });
    let script = "call tether.request_permission net:example.com\nprint $_\n\
                  call tether.request_permission fs:/etc\nprint $_";
    let worker = h
        .env
        .create_worker(SourceRef::inline(script), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(h.out.contents(), "True\nFalse\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_host_methods() {
    let h = host();
    let options = WorkerOptions::new().method("double", |args: Vec<Value>| async move {
        let n = args.first().and_then(Value::as_int).unwrap_or(0);
        Ok::<_, tether::RemoteError>(Value::Int(n * 2))
    });
    let worker = h
        .env
        .create_worker(SourceRef::inline("call tether.call double 21\nprint $_\ncall tether.call missing"), options)
        .await
        .unwrap();
    match worker.finished().await.unwrap() {
        Err(RunError::Remote(e)) => {
            assert_eq!(e.kind, "RuntimeError");
            assert!(e.message.contains("missing"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.out.contents(), "42\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_storage_from_worker() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path().join("kv.redb"), "worker").unwrap();
    let out = MemorySurface::new();
    let env = Arc::new(
        Environment::builder(Role::Host, Settings::default())
            .output(Arc::new(out.clone()))
            .storage(storage)
            .build(),
    );
    let script = "call tether.call storage.set greeting hello\n\
                  call tether.call storage.sync\n\
                  call tether.call storage.get greeting\n\
                  print $_";
    let worker = env
        .create_worker(SourceRef::inline(script), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();
    assert_eq!(out.contents(), "hello\n");

    let store = env.storage().unwrap().lock();
    assert_eq!(store.pending(), 0);
    assert_eq!(store.get("greeting").unwrap(), Some(Value::str("hello")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminals
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_line_reaches_worker() {
    let h = host();
    let screen = MemorySurface::new();
    let worker = h
        .env
        .create_worker(
            SourceRef::inline("input name Name?\nprint hello $name"),
            WorkerOptions::new().terminal(TerminalDescriptor::new("term", Arc::new(screen.clone()))),
        )
        .await
        .unwrap();
    let session = h.env.terminal(worker.id()).unwrap();
    wait_for(|| session.state() == SessionState::Reading).await;

    session.input("h");
    session.input("i");
    session.input("\r");
    worker.finished().await.unwrap().unwrap();

    assert_eq!(screen.contents(), "Name?hi\r\nhello hi\r\n");
    assert_eq!(session.line(), "");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(h.out.contents(), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_attaches_once_per_worker() {
    let h = host();
    let worker = h
        .env
        .create_worker(SourceRef::inline(""), WorkerOptions::new())
        .await
        .unwrap();
    worker.finished().await.unwrap().unwrap();

    let first = MemorySurface::new();
    let second = MemorySurface::new();
    assert!(h
        .env
        .attach_terminal(&worker, TerminalDescriptor::new("a", Arc::new(first.clone())))
        .unwrap());
    assert!(!h
        .env
        .attach_terminal(&worker, TerminalDescriptor::new("b", Arc::new(second.clone())))
        .unwrap());

    worker.run("print once", RunMode::Sync).await.unwrap();
    assert_eq!(first.contents(), "once\r\n");
    assert_eq!(second.contents(), "");

    let id = worker.id();
    worker.join().await.unwrap();
    assert!(h.env.terminal(id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_without_terminal_is_an_error() {
    let h = host();
    let worker = h
        .env
        .create_worker(SourceRef::inline("input name"), WorkerOptions::new())
        .await
        .unwrap();
    match worker.finished().await.unwrap() {
        Err(RunError::Remote(e)) => assert!(e.message.contains("not attached")),
        other => panic!("unexpected outcome {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Teardown
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_rejects_pending_run() {
    let h = host();
    let options = WorkerOptions::new().method("hang", |_| futures::future::pending::<Result<Value, tether::RemoteError>>());
    let worker = h
        .env
        .create_worker(SourceRef::inline("call tether.call hang"), options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    worker.terminate();
    assert!(worker.is_terminated());
    match worker.finished().await.unwrap() {
        Err(RunError::Transport(ChannelError::Closed)) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(
        worker.run("print late", RunMode::Sync).await,
        Err(RunError::Transport(ChannelError::Closed))
    ));
    worker.join().await.unwrap();
}

/// Blocks every run until released. Reports when the worker drops it.
struct Blocking {
    gate: Arc<Mutex<mpsc::Receiver<()>>>,
    gone: mpsc::Sender<()>,
}

impl Interpreter for Blocking {
    fn kind(&self) -> &str {
        "blocking"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn run(&mut self, _code: &str) -> Result<Value, InterpreterError> {
        let _ = self.gate.lock().recv_timeout(Duration::from_secs(5));
        Ok(Value::Null)
    }

    fn run_async<'a>(&'a mut self, code: &'a str) -> BoxFuture<'a, Result<Value, InterpreterError>> {
        Box::pin(async move { self.run(code) })
    }

    fn register_module(&mut self, _namespace: &str, _module: Module) {}

    fn set_stdout(&mut self, _sink: Box<dyn OutputSink>) {}

    fn set_stderr(&mut self, _sink: Box<dyn OutputSink>) {}

    fn set_stdin(&mut self, _source: Box<dyn InputSource>) {}
}

impl Drop for Blocking {
    fn drop(&mut self) {
        let _ = self.gone.send(());
    }
}

struct BlockingFactory {
    gate: Arc<Mutex<mpsc::Receiver<()>>>,
    gone: mpsc::Sender<()>,
}

impl InterpreterFactory for BlockingFactory {
    fn kind(&self) -> &str {
        "blocking"
    }

    fn create(&self, _version: Option<&str>, _config: &Value) -> Result<Box<dyn Interpreter>, InterpreterError> {
        Ok(Box::new(Blocking {
            gate: self.gate.clone(),
            gone: self.gone.clone(),
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_a_busy_worker_returns_promptly() {
    let h = host();
    let (release, gate) = mpsc::channel();
    let (gone_tx, gone) = mpsc::channel();
    h.env.register_interpreter(Arc::new(BlockingFactory {
        gate: Arc::new(Mutex::new(gate)),
        gone: gone_tx,
    }));

    let worker = h
        .env
        .create_worker(SourceRef::inline("spin"), WorkerOptions::new().interpreter("blocking"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    drop(worker);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Once the run ends the thread exits and drops its interpreter.
    release.send(()).unwrap();
    let exited = tokio::task::spawn_blocking(move || gone.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(exited.is_ok());
}
