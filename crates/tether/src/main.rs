//! Tether CLI
//!
//! Runs a script in a worker (or in-process) through the hook lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::{
    ConfigSource, Environment, Phase, Role, RunMode, Settings, SourceRef, StdoutSurface, Storage,
    TerminalDescriptor, Value, WorkerOptions,
};

/// Run interpreters on worker threads
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Run embedded interpreters on worker threads", long_about = None)]
struct Args {
    /// Settings file (defaults to ./tether.toml when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script
    Run {
        /// Script path or file:// URL
        script: String,

        /// Interpreter kind
        #[arg(short, long)]
        interpreter: Option<String>,

        /// Interpreter version
        #[arg(long)]
        version: Option<String>,

        /// Worker configuration (JSON or TOML)
        #[arg(short, long)]
        config: Option<String>,

        /// Use the async run phases
        #[arg(long = "async")]
        run_async: bool,

        /// Attach this terminal so the script can read input
        #[arg(short, long)]
        terminal: bool,

        /// Run in this process instead of a worker
        #[arg(long)]
        local: bool,

        /// Expose the named key-value store to the worker
        #[arg(long)]
        storage: Option<String>,
    },

    /// List hook phases
    Phases,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let result = runtime.block_on(async_main());
    // A pending stdin read would otherwise hold shutdown.
    runtime.shutdown_background();
    result
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.settings.as_deref())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Phases => {
            for phase in Phase::ALL {
                println!("{:<20} {:?}", phase.as_str(), phase.kind());
            }
            Ok(())
        }
        Command::Run {
            script,
            interpreter,
            version,
            config,
            run_async,
            terminal,
            local,
            storage,
        } => {
            let mode = if run_async { RunMode::Async } else { settings.run_mode };
            let mut builder = Environment::builder(Role::Host, settings.clone());
            if let Some(name) = storage {
                builder = builder.storage(Storage::open(&settings.storage_path, &name)?);
            }
            let env = Arc::new(builder.build());

            if local {
                return run_local(&env, &script, interpreter, version.as_deref(), mode).await;
            }

            let mut options = WorkerOptions::new().mode(mode);
            if let Some(kind) = interpreter {
                options = options.interpreter(kind);
            }
            if let Some(version) = version {
                options = options.version(version);
            }
            if let Some(url) = config {
                options = options.config(ConfigSource::Url(url));
            }
            if terminal {
                options = options.terminal(TerminalDescriptor::new("stdio", Arc::new(StdoutSurface)));
            }

            info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));
            let handle = env.create_worker(SourceRef::url(script), options).await?;

            if let Some(session) = env.terminal(handle.id()) {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => session.feed_line(&line),
                            Ok(None) => break,
                            Err(e) => {
                                warn!("stdin closed: {}", e);
                                break;
                            }
                        }
                    }
                });
            }

            let outcome = handle.finished().await;
            if let Some(store) = env.storage().cloned() {
                tokio::task::spawn_blocking(move || store.lock().sync()).await??;
            }
            handle.join().await?;
            match outcome {
                Some(Ok(value)) => {
                    print_result(&value);
                    Ok(())
                }
                Some(Err(e)) => Err(e.into()),
                None => Ok(()),
            }
        }
    }
}

async fn run_local(
    env: &Environment,
    script: &str,
    interpreter: Option<String>,
    version: Option<&str>,
    mode: RunMode,
) -> Result<()> {
    let source = SourceRef::url(script);
    let code = source.load(&tether::FileFetch::new()).await?;
    let kind = interpreter.unwrap_or_else(|| env.settings().interpreter.clone());
    let mut interp = env.create_interpreter(&kind, version, &Value::Null)?;
    let value = match mode {
        RunMode::Sync => env.run_local(&mut *interp, source.label(), &code, &Value::Null)?,
        RunMode::Async => {
            env.run_local_async(&mut *interp, source.label(), &code, &Value::Null)
                .await?
        }
    };
    print_result(&value);
    Ok(())
}

fn print_result(value: &Value) {
    if !value.is_null() {
        println!("{value}");
    }
}
