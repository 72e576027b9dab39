//! Hook Registry
//!
//! Named lifecycle phases, each holding an ordered, deduplicated set of
//! contributions from plugins. Callback phases hold callables, code phases
//! hold source fragments. Insertion order is the order callbacks run and
//! the order fragments are concatenated in.
//!
//! Every context owns its own registry (see [`crate::Environment`]). A host
//! registry may additionally collect *code* for the worker role; that code
//! is shipped to each worker when it boots.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tether_channel::WorkerProxy;
use tether_types::Value;

use crate::error::HookError;
use crate::interpreter::Interpreter;
use crate::lifecycle::RunDescriptor;

// ─────────────────────────────────────────────────────────────────────────────
// Roles and phases
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the channel a context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// What a phase collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Callback,
    Code,
}

impl HookKind {
    fn as_str(&self) -> &'static str {
        match self {
            HookKind::Callback => "callback",
            HookKind::Code => "code",
        }
    }
}

/// A lifecycle injection point. The string names are shared by every plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "onReady")]
    OnReady,
    #[serde(rename = "onBeforeRun")]
    OnBeforeRun,
    #[serde(rename = "onBeforeRunAsync")]
    OnBeforeRunAsync,
    #[serde(rename = "onAfterRun")]
    OnAfterRun,
    #[serde(rename = "onAfterRunAsync")]
    OnAfterRunAsync,
    #[serde(rename = "codeBeforeRun")]
    CodeBeforeRun,
    #[serde(rename = "codeBeforeRunAsync")]
    CodeBeforeRunAsync,
    #[serde(rename = "codeAfterRun")]
    CodeAfterRun,
    #[serde(rename = "codeAfterRunAsync")]
    CodeAfterRunAsync,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::OnReady,
        Phase::OnBeforeRun,
        Phase::OnBeforeRunAsync,
        Phase::OnAfterRun,
        Phase::OnAfterRunAsync,
        Phase::CodeBeforeRun,
        Phase::CodeBeforeRunAsync,
        Phase::CodeAfterRun,
        Phase::CodeAfterRunAsync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::OnReady => "onReady",
            Phase::OnBeforeRun => "onBeforeRun",
            Phase::OnBeforeRunAsync => "onBeforeRunAsync",
            Phase::OnAfterRun => "onAfterRun",
            Phase::OnAfterRunAsync => "onAfterRunAsync",
            Phase::CodeBeforeRun => "codeBeforeRun",
            Phase::CodeBeforeRunAsync => "codeBeforeRunAsync",
            Phase::CodeAfterRun => "codeAfterRun",
            Phase::CodeAfterRunAsync => "codeAfterRunAsync",
        }
    }

    pub fn kind(&self) -> HookKind {
        match self {
            Phase::OnReady
            | Phase::OnBeforeRun
            | Phase::OnBeforeRunAsync
            | Phase::OnAfterRun
            | Phase::OnAfterRunAsync => HookKind::Callback,
            Phase::CodeBeforeRun
            | Phase::CodeBeforeRunAsync
            | Phase::CodeAfterRun
            | Phase::CodeAfterRunAsync => HookKind::Code,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| HookError::UnknownPhase(s.to_string()))
    }
}

/// What to do with a registration aimed at the wrong context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolePolicy {
    #[default]
    Reject,
    Ignore,
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook elements
// ─────────────────────────────────────────────────────────────────────────────

/// What a callback sees when its phase fires.
pub struct HookContext<'a> {
    pub role: Role,
    pub phase: Phase,
    pub run: &'a RunDescriptor,
    /// The bound interpreter, when this context runs one.
    pub interpreter: Option<&'a mut (dyn Interpreter + 'static)>,
    /// Parsed configuration of the run's worker.
    pub config: &'a Value,
    /// Host side only: the worker this run belongs to.
    pub worker: Option<&'a WorkerProxy>,
}

type CallbackFn = dyn Fn(&mut HookContext<'_>) -> anyhow::Result<()> + Send + Sync;

/// A callback hook. Clones share identity, which is what deduplication uses.
#[derive(Clone)]
pub struct Callback {
    name: String,
    func: Arc<CallbackFn>,
}

impl Callback {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        (self.func)(ctx)
    }

    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.name)
    }
}

/// A contribution to a phase.
#[derive(Debug, Clone)]
pub enum Hook {
    Callback(Callback),
    Code(String),
}

impl Hook {
    fn kind(&self) -> HookKind {
        match self {
            Hook::Callback(_) => HookKind::Callback,
            Hook::Code(_) => HookKind::Code,
        }
    }
}

impl From<Callback> for Hook {
    fn from(cb: Callback) -> Self {
        Hook::Callback(cb)
    }
}

impl From<&str> for Hook {
    fn from(code: &str) -> Self {
        Hook::Code(code.to_string())
    }
}

impl From<String> for Hook {
    fn from(code: String) -> Self {
        Hook::Code(code)
    }
}

/// Identity used for deduplication.
pub trait HookIdentity {
    fn same(&self, other: &Self) -> bool;
}

impl HookIdentity for Callback {
    fn same(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl HookIdentity for String {
    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook set
// ─────────────────────────────────────────────────────────────────────────────

/// Insertion-ordered set, unique by identity.
#[derive(Debug, Clone)]
pub struct HookSet<T> {
    items: Vec<T>,
}

impl<T> Default for HookSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: HookIdentity + Clone> HookSet<T> {
    /// Append unless already present. Returns `true` if inserted.
    pub fn insert(&mut self, item: T) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Returns `true` if the item was present.
    pub fn remove(&mut self, item: &T) -> bool {
        let before = self.items.len();
        self.items.retain(|i| !i.same(item));
        self.items.len() != before
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.iter().any(|i| i.same(item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PhaseHooks {
    callbacks: HashMap<Phase, HookSet<Callback>>,
    code: HashMap<Phase, HookSet<String>>,
}

/// Code contributed to worker phases, in registration order, ready to ship.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCode {
    pub phases: Vec<(Phase, Vec<String>)>,
}

enum Scope {
    Local,
    /// Host-held code for worker phases
    Shipped,
}

/// The hook registry of one context.
pub struct Hooks {
    role: Role,
    policy: RolePolicy,
    local: RwLock<PhaseHooks>,
    shipped: RwLock<HashMap<Phase, HookSet<String>>>,
}

impl Hooks {
    pub fn new(role: Role, policy: RolePolicy) -> Self {
        Self {
            role,
            policy,
            local: RwLock::new(PhaseHooks::default()),
            shipped: RwLock::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Register a hook. Returns `false` if it was already registered, or if
    /// it was dropped under [`RolePolicy::Ignore`].
    pub fn register(&self, role: Role, phase: Phase, hook: impl Into<Hook>) -> Result<bool, HookError> {
        let hook = hook.into();
        check_kind(phase, &hook)?;
        let Some(scope) = self.admit(role, phase, &hook)? else {
            return Ok(false);
        };
        let inserted = match (scope, hook) {
            (Scope::Local, Hook::Callback(cb)) => {
                self.local.write().callbacks.entry(phase).or_default().insert(cb)
            }
            (Scope::Local, Hook::Code(code)) => {
                self.local.write().code.entry(phase).or_default().insert(code)
            }
            (Scope::Shipped, Hook::Code(code)) => {
                self.shipped.write().entry(phase).or_default().insert(code)
            }
            (Scope::Shipped, Hook::Callback(_)) => false,
        };
        if inserted {
            tracing::debug!("[hooks:{}] registered {} {} hook", self.role, role, phase);
        }
        Ok(inserted)
    }

    /// Remove a hook. Returns `true` if it was registered.
    pub fn unregister(&self, role: Role, phase: Phase, hook: &Hook) -> Result<bool, HookError> {
        check_kind(phase, hook)?;
        let Some(scope) = self.admit(role, phase, hook)? else {
            return Ok(false);
        };
        Ok(match (scope, hook) {
            (Scope::Local, Hook::Callback(cb)) => self
                .local
                .write()
                .callbacks
                .get_mut(&phase)
                .is_some_and(|set| set.remove(cb)),
            (Scope::Local, Hook::Code(code)) => self
                .local
                .write()
                .code
                .get_mut(&phase)
                .is_some_and(|set| set.remove(code)),
            (Scope::Shipped, Hook::Code(code)) => self
                .shipped
                .write()
                .get_mut(&phase)
                .is_some_and(|set| set.remove(code)),
            (Scope::Shipped, Hook::Callback(_)) => false,
        })
    }

    /// Callbacks of a local phase, in registration order.
    pub fn callbacks(&self, phase: Phase) -> Vec<Callback> {
        self.local
            .read()
            .callbacks
            .get(&phase)
            .map(HookSet::to_vec)
            .unwrap_or_default()
    }

    /// Fragments of a local code phase, in registration order.
    pub fn fragments(&self, phase: Phase) -> Vec<String> {
        self.local
            .read()
            .code
            .get(&phase)
            .map(HookSet::to_vec)
            .unwrap_or_default()
    }

    /// The source blob for a local code phase: each fragment dedented,
    /// joined with newlines.
    pub fn compose_code(&self, phase: Phase) -> String {
        compose(&self.fragments(phase))
    }

    /// Snapshot of host-held worker code.
    pub fn worker_code(&self) -> WorkerCode {
        let shipped = self.shipped.read();
        WorkerCode {
            phases: Phase::ALL
                .into_iter()
                .filter_map(|phase| {
                    shipped
                        .get(&phase)
                        .filter(|set| !set.is_empty())
                        .map(|set| (phase, set.to_vec()))
                })
                .collect(),
        }
    }

    /// Seed a worker registry with code shipped from its host.
    pub fn install_worker_code(&self, code: &WorkerCode) -> Result<(), HookError> {
        for (phase, fragments) in &code.phases {
            for fragment in fragments {
                self.register(Role::Worker, *phase, fragment.as_str())?;
            }
        }
        Ok(())
    }

    fn admit(&self, role: Role, phase: Phase, hook: &Hook) -> Result<Option<Scope>, HookError> {
        if role == self.role {
            return Ok(Some(Scope::Local));
        }
        if self.role == Role::Host && role == Role::Worker && matches!(hook, Hook::Code(_)) {
            return Ok(Some(Scope::Shipped));
        }
        match self.policy {
            RolePolicy::Reject => Err(HookError::WrongRole {
                role,
                phase,
                context: self.role,
            }),
            RolePolicy::Ignore => {
                tracing::warn!(
                    "[hooks:{}] ignoring {} {} hook registered from the wrong context",
                    self.role,
                    role,
                    phase
                );
                Ok(None)
            }
        }
    }
}

fn check_kind(phase: Phase, hook: &Hook) -> Result<(), HookError> {
    let expected = phase.kind();
    if hook.kind() != expected {
        return Err(HookError::KindMismatch {
            phase,
            expected: expected.as_str(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Code composition
// ─────────────────────────────────────────────────────────────────────────────

/// Join fragments into one top-level source blob.
pub fn compose(fragments: &[String]) -> String {
    fragments
        .iter()
        .map(|f| dedent(f))
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip the leading whitespace common to all non-blank lines, and drop
/// leading and trailing blank lines.
pub fn dedent(code: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    let Some(start) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return String::new();
    };
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .unwrap_or(start);
    let body = &lines[start..=end];

    let mut common: Option<&str> = None;
    for line in body.iter().filter(|l| !l.trim().is_empty()) {
        let indent = &line[..line.len() - line.trim_start().len()];
        common = Some(match common {
            None => indent,
            Some(prev) => common_prefix(prev, indent),
        });
    }
    let common = common.unwrap_or("");

    body.iter()
        .map(|line| line.strip_prefix(common).unwrap_or(line.trim_start()))
        .map(|line| if line.trim().is_empty() { "" } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()));
    &a[..end]
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Callback {
        Callback::new(name, |_| Ok(()))
    }

    #[test]
    fn test_phase_names_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
            assert_eq!(
                serde_json::to_string(&phase).unwrap(),
                format!("\"{}\"", phase.as_str())
            );
        }
        assert!(matches!(
            "onLoad".parse::<Phase>(),
            Err(HookError::UnknownPhase(_))
        ));
    }

    #[test]
    fn test_duplicate_callback_is_noop() {
        let hooks = Hooks::new(Role::Host, RolePolicy::Reject);
        let cb = noop("plugin");
        assert!(hooks.register(Role::Host, Phase::OnReady, cb.clone()).unwrap());
        assert!(!hooks.register(Role::Host, Phase::OnReady, cb.clone()).unwrap());
        assert_eq!(hooks.callbacks(Phase::OnReady).len(), 1);

        // Same body, different identity: both kept.
        assert!(hooks.register(Role::Host, Phase::OnReady, noop("plugin")).unwrap());
        assert_eq!(hooks.callbacks(Phase::OnReady).len(), 2);
    }

    #[test]
    fn test_unregister_then_register_restores() {
        let hooks = Hooks::new(Role::Host, RolePolicy::Reject);
        let cb = noop("p");
        hooks.register(Role::Host, Phase::OnBeforeRun, cb.clone()).unwrap();
        assert!(hooks
            .unregister(Role::Host, Phase::OnBeforeRun, &cb.clone().into())
            .unwrap());
        assert!(hooks.callbacks(Phase::OnBeforeRun).is_empty());
        assert!(hooks.register(Role::Host, Phase::OnBeforeRun, cb).unwrap());
        assert_eq!(hooks.callbacks(Phase::OnBeforeRun).len(), 1);
    }

    #[test]
    fn test_code_order_and_dedupe() {
        let hooks = Hooks::new(Role::Worker, RolePolicy::Reject);
        hooks.register(Role::Worker, Phase::CodeBeforeRun, "a").unwrap();
        hooks.register(Role::Worker, Phase::CodeBeforeRun, "b").unwrap();
        hooks.register(Role::Worker, Phase::CodeBeforeRun, "a").unwrap();
        assert_eq!(hooks.compose_code(Phase::CodeBeforeRun), "a\nb");
    }

    #[test]
    fn test_fragments_dedented_individually() {
        let hooks = Hooks::new(Role::Worker, RolePolicy::Reject);
        hooks
            .register(
                Role::Worker,
                Phase::CodeAfterRun,
                "\n        set x 1\n        print $x\n    ",
            )
            .unwrap();
        hooks
            .register(Role::Worker, Phase::CodeAfterRun, "  print done")
            .unwrap();
        assert_eq!(
            hooks.compose_code(Phase::CodeAfterRun),
            "set x 1\nprint $x\nprint done"
        );
    }

    #[test]
    fn test_dedent_keeps_relative_indent() {
        assert_eq!(dedent("    if x:\n        y\n\n    z"), "if x:\n    y\n\nz");
        assert_eq!(dedent("\t\ta\n\t b"), "\ta\n b");
        assert_eq!(dedent("   \n  \n"), "");
    }

    #[test]
    fn test_kind_mismatch() {
        let hooks = Hooks::new(Role::Host, RolePolicy::Reject);
        assert!(matches!(
            hooks.register(Role::Host, Phase::OnReady, "print hi"),
            Err(HookError::KindMismatch { .. })
        ));
        assert!(matches!(
            hooks.register(Role::Host, Phase::CodeBeforeRun, noop("x")),
            Err(HookError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_role_policies() {
        let worker = Hooks::new(Role::Worker, RolePolicy::Reject);
        assert!(matches!(
            worker.register(Role::Host, Phase::OnReady, noop("x")),
            Err(HookError::WrongRole { .. })
        ));

        let host = Hooks::new(Role::Host, RolePolicy::Reject);
        assert!(matches!(
            host.register(Role::Worker, Phase::OnReady, noop("x")),
            Err(HookError::WrongRole { .. })
        ));

        let lenient = Hooks::new(Role::Worker, RolePolicy::Ignore);
        assert!(!lenient.register(Role::Host, Phase::CodeBeforeRun, "x").unwrap());
        assert!(lenient.fragments(Phase::CodeBeforeRun).is_empty());
    }

    #[test]
    fn test_host_ships_worker_code() {
        let host = Hooks::new(Role::Host, RolePolicy::Reject);
        host.register(Role::Worker, Phase::CodeBeforeRun, "set a 1").unwrap();
        host.register(Role::Worker, Phase::CodeBeforeRun, "set b 2").unwrap();
        host.register(Role::Worker, Phase::CodeAfterRunAsync, "print bye").unwrap();
        // Not part of the host's own phases.
        assert!(host.fragments(Phase::CodeBeforeRun).is_empty());

        let shipped = host.worker_code();
        let worker = Hooks::new(Role::Worker, RolePolicy::Reject);
        worker.install_worker_code(&shipped).unwrap();
        // A second bootstrap pass does not duplicate.
        worker.install_worker_code(&shipped).unwrap();
        assert_eq!(worker.compose_code(Phase::CodeBeforeRun), "set a 1\nset b 2");
        assert_eq!(worker.compose_code(Phase::CodeAfterRunAsync), "print bye");
    }
}
