//! Lifecycle Driver
//!
//! Sequences the hook phases around one interpreter invocation:
//!
//! ```text
//! Created → Ready → (BeforeRun → Executing → AfterRun)*
//! ```
//!
//! `onReady` fires exactly once per context behind a "first caller wins,
//! others wait" gate. Before a run the composed `codeBeforeRun` source is
//! executed and then the `onBeforeRun` callbacks fire; after the run the
//! callbacks fire first and the `codeAfterRun` source follows, unless
//! [`AfterRunOrder::CodeFirst`] is configured.
//!
//! A failing callback is reported and the rest of its phase still runs. A
//! failing code fragment aborts the run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_channel::WorkerProxy;
use tether_types::Value;
use tokio::sync::OnceCell;

use crate::error::RunError;
use crate::hooks::{HookContext, Hooks, Phase, Role};
use crate::interpreter::Interpreter;
use crate::notify::Notify;

/// Declared mode of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Sync,
    Async,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Sync => write!(f, "sync"),
            RunMode::Async => write!(f, "async"),
        }
    }
}

/// Order of the two after-run phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterRunOrder {
    #[default]
    CallbacksFirst,
    CodeFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Ready,
    BeforeRun,
    Executing,
    AfterRun,
}

/// One discrete run: a script, a REPL line, a function invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    pub id: u64,
    /// Where the code came from (a URL, a path, `<inline>`).
    pub source: String,
    pub mode: RunMode,
}

/// What a run is bound to. Handed to every callback of the run.
pub struct RunScope<'a> {
    pub interpreter: Option<&'a mut (dyn Interpreter + 'static)>,
    pub config: &'a Value,
    pub worker: Option<&'a WorkerProxy>,
}

impl<'a> RunScope<'a> {
    /// A run executed by a local interpreter.
    pub fn local(interpreter: &'a mut (dyn Interpreter + 'static), config: &'a Value) -> Self {
        Self {
            interpreter: Some(interpreter),
            config,
            worker: None,
        }
    }

    /// A host-side run whose execution happens in a worker.
    pub fn remote(worker: &'a WorkerProxy, config: &'a Value) -> Self {
        Self {
            interpreter: None,
            config,
            worker: Some(worker),
        }
    }
}

struct PhaseSet {
    code_before: Phase,
    before: Phase,
    after: Phase,
    code_after: Phase,
}

const SYNC_PHASES: PhaseSet = PhaseSet {
    code_before: Phase::CodeBeforeRun,
    before: Phase::OnBeforeRun,
    after: Phase::OnAfterRun,
    code_after: Phase::CodeAfterRun,
};

const ASYNC_PHASES: PhaseSet = PhaseSet {
    code_before: Phase::CodeBeforeRunAsync,
    before: Phase::OnBeforeRunAsync,
    after: Phase::OnAfterRunAsync,
    code_after: Phase::CodeAfterRunAsync,
};

pub struct Lifecycle {
    role: Role,
    hooks: Arc<Hooks>,
    notifier: Arc<dyn Notify>,
    after_run_order: AfterRunOrder,
    ready: OnceCell<()>,
    /// Runs in flight, keyed by run id. Host-side runs for different
    /// workers overlap, so each keeps its own state.
    runs: Mutex<HashMap<u64, LifecycleState>>,
    next_run: AtomicU64,
}

impl Lifecycle {
    pub fn new(hooks: Arc<Hooks>, notifier: Arc<dyn Notify>, after_run_order: AfterRunOrder) -> Self {
        Self {
            role: hooks.role(),
            hooks,
            notifier,
            after_run_order,
            ready: OnceCell::new(),
            runs: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    /// `Created` until the ready gate has fired, `Ready` after. See
    /// [`Lifecycle::run_state`] for runs in progress.
    pub fn state(&self) -> LifecycleState {
        if self.is_ready() {
            LifecycleState::Ready
        } else {
            LifecycleState::Created
        }
    }

    /// Where a run in progress is. `None` once it has finished.
    pub fn run_state(&self, run: &RunDescriptor) -> Option<LifecycleState> {
        self.runs.lock().get(&run.id).copied()
    }

    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    pub fn descriptor(&self, source: impl Into<String>, mode: RunMode) -> RunDescriptor {
        RunDescriptor {
            id: self.next_run.fetch_add(1, Ordering::SeqCst),
            source: source.into(),
            mode,
        }
    }

    /// Route an error to the notification sink. Failures the worker already
    /// reported are not repeated.
    pub fn report(&self, err: &RunError) {
        if matches!(err, RunError::Remote(_)) {
            tracing::debug!("[lifecycle:{}] worker reported: {}", self.role, err);
            return;
        }
        self.notifier.notify(&err.to_string());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ready gate
    // ─────────────────────────────────────────────────────────────────────

    /// Fire `onReady` unless it already fired. Blocking; for the worker
    /// thread and other non-async callers.
    pub fn ensure_ready(&self, run: &RunDescriptor, scope: &mut RunScope<'_>) {
        if self.is_ready() {
            return;
        }
        futures::executor::block_on(self.ensure_ready_async(run, scope));
    }

    /// Fire `onReady` unless it already fired. Concurrent callers wait for
    /// the first one to finish.
    pub async fn ensure_ready_async(&self, run: &RunDescriptor, scope: &mut RunScope<'_>) {
        self.ready
            .get_or_init(|| async move {
                tracing::debug!("[lifecycle:{}] ready (run {})", self.role, run.id);
                self.fire(Phase::OnReady, run, scope);
            })
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phases
    // ─────────────────────────────────────────────────────────────────────

    /// Invoke every callback of a phase in registration order. Returns the
    /// number of callbacks that failed.
    pub fn fire(&self, phase: Phase, run: &RunDescriptor, scope: &mut RunScope<'_>) -> usize {
        let mut failed = 0;
        for callback in self.hooks.callbacks(phase) {
            let mut ctx = HookContext {
                role: self.role,
                phase,
                run,
                interpreter: scope.interpreter.as_deref_mut(),
                config: scope.config,
                worker: scope.worker,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| callback.call(&mut ctx)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{} callback '{}' failed: {e:#}", phase, callback.name()),
                Err(_) => format!("{} callback '{}' panicked", phase, callback.name()),
            };
            failed += 1;
            tracing::warn!("[lifecycle:{}] {}", self.role, message);
            self.notifier.notify(&message);
        }
        failed
    }

    fn exec_code(&self, phase: Phase, scope: &mut RunScope<'_>) -> Result<(), RunError> {
        let code = self.hooks.compose_code(phase);
        if code.is_empty() {
            return Ok(());
        }
        let Some(interpreter) = scope.interpreter.as_deref_mut() else {
            tracing::warn!("[lifecycle:{}] no interpreter to run {} code", self.role, phase);
            return Ok(());
        };
        tracing::debug!("[lifecycle:{}] executing {} ({} bytes)", self.role, phase, code.len());
        interpreter
            .run(&code)
            .map(drop)
            .map_err(|source| self.code_failed(phase, source))
    }

    async fn exec_code_async(&self, phase: Phase, scope: &mut RunScope<'_>) -> Result<(), RunError> {
        let code = self.hooks.compose_code(phase);
        if code.is_empty() {
            return Ok(());
        }
        let Some(interpreter) = scope.interpreter.as_deref_mut() else {
            tracing::warn!("[lifecycle:{}] no interpreter to run {} code", self.role, phase);
            return Ok(());
        };
        tracing::debug!("[lifecycle:{}] executing {} ({} bytes)", self.role, phase, code.len());
        interpreter
            .run_async(&code)
            .await
            .map(drop)
            .map_err(|source| self.code_failed(phase, source))
    }

    fn code_failed(&self, phase: Phase, source: crate::interpreter::InterpreterError) -> RunError {
        let err = RunError::HookCode { phase, source };
        self.report(&err);
        err
    }

    /// Back to `Ready` means the run is over.
    fn set_state(&self, run: &RunDescriptor, state: LifecycleState) {
        tracing::trace!("[lifecycle:{}] run {} -> {:?}", self.role, run.id, state);
        let mut runs = self.runs.lock();
        if state == LifecycleState::Ready {
            runs.remove(&run.id);
        } else {
            runs.insert(run.id, state);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync runs
    // ─────────────────────────────────────────────────────────────────────

    /// Ready gate, `codeBeforeRun`, then `onBeforeRun`.
    pub fn before_run(&self, run: &RunDescriptor, scope: &mut RunScope<'_>) -> Result<(), RunError> {
        self.ensure_ready(run, scope);
        self.set_state(run, LifecycleState::BeforeRun);
        if let Err(e) = self.exec_code(SYNC_PHASES.code_before, scope) {
            self.set_state(run, LifecycleState::Ready);
            return Err(e);
        }
        self.fire(SYNC_PHASES.before, run, scope);
        self.set_state(run, LifecycleState::Executing);
        Ok(())
    }

    /// `onAfterRun` and `codeAfterRun`. Fires whatever the outcome was; an
    /// after-run code failure only replaces a successful outcome.
    pub fn after_run(
        &self,
        run: &RunDescriptor,
        scope: &mut RunScope<'_>,
        outcome: Result<Value, RunError>,
    ) -> Result<Value, RunError> {
        self.set_state(run, LifecycleState::AfterRun);
        let code = match self.after_run_order {
            AfterRunOrder::CallbacksFirst => {
                self.fire(SYNC_PHASES.after, run, scope);
                self.exec_code(SYNC_PHASES.code_after, scope)
            }
            AfterRunOrder::CodeFirst => {
                let code = self.exec_code(SYNC_PHASES.code_after, scope);
                self.fire(SYNC_PHASES.after, run, scope);
                code
            }
        };
        self.set_state(run, LifecycleState::Ready);
        let value = outcome?;
        code?;
        Ok(value)
    }

    /// Run code in the scope's interpreter through the whole lifecycle.
    pub fn run(&self, run: &RunDescriptor, scope: &mut RunScope<'_>, code: &str) -> Result<Value, RunError> {
        self.before_run(run, scope)?;
        let outcome = match scope.interpreter.as_deref_mut() {
            Some(interpreter) => interpreter.run(code).map_err(RunError::Execution),
            None => Err(no_interpreter()),
        };
        if let Err(e) = &outcome {
            self.report(e);
        }
        self.after_run(run, scope, outcome)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Async runs
    // ─────────────────────────────────────────────────────────────────────

    pub async fn before_run_async(&self, run: &RunDescriptor, scope: &mut RunScope<'_>) -> Result<(), RunError> {
        self.ensure_ready_async(run, scope).await;
        self.set_state(run, LifecycleState::BeforeRun);
        if let Err(e) = self.exec_code_async(ASYNC_PHASES.code_before, scope).await {
            self.set_state(run, LifecycleState::Ready);
            return Err(e);
        }
        self.fire(ASYNC_PHASES.before, run, scope);
        self.set_state(run, LifecycleState::Executing);
        Ok(())
    }

    pub async fn after_run_async(
        &self,
        run: &RunDescriptor,
        scope: &mut RunScope<'_>,
        outcome: Result<Value, RunError>,
    ) -> Result<Value, RunError> {
        self.set_state(run, LifecycleState::AfterRun);
        let code = match self.after_run_order {
            AfterRunOrder::CallbacksFirst => {
                self.fire(ASYNC_PHASES.after, run, scope);
                self.exec_code_async(ASYNC_PHASES.code_after, scope).await
            }
            AfterRunOrder::CodeFirst => {
                let code = self.exec_code_async(ASYNC_PHASES.code_after, scope).await;
                self.fire(ASYNC_PHASES.after, run, scope);
                code
            }
        };
        self.set_state(run, LifecycleState::Ready);
        let value = outcome?;
        code?;
        Ok(value)
    }

    pub async fn run_async(
        &self,
        run: &RunDescriptor,
        scope: &mut RunScope<'_>,
        code: &str,
    ) -> Result<Value, RunError> {
        self.before_run_async(run, scope).await?;
        let outcome = match scope.interpreter.as_deref_mut() {
            Some(interpreter) => interpreter.run_async(code).await.map_err(RunError::Execution),
            None => Err(no_interpreter()),
        };
        if let Err(e) = &outcome {
            self.report(e);
        }
        self.after_run_async(run, scope, outcome).await
    }
}

fn no_interpreter() -> RunError {
    RunError::Execution(crate::interpreter::InterpreterError::new(
        "RuntimeError",
        "no interpreter bound to this run",
    ))
}
