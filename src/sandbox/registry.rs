//! The context registry: one interpreter instance, many contexts.
//!
//! The registry owns the interpreter and every context created on it. Each
//! `exec` activates one context's namespace by handing the interpreter a
//! frame environment that resolves names through that context and its
//! ancestors and runs every binding through the variable guard.
//!
//! Only one top-level execution may be active at a time. Tool callbacks
//! re-enter through a [`Session`], which pushes nested frames onto the same
//! call stack.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::{debug, debug_span, warn};

use crate::error::{ErrorKind, ExecError, Result, SandboxError};
use crate::interpreter::script::is_keyword;
use crate::interpreter::{Environment, Interpreter, ScriptInterpreter};
use crate::sandbox::bridge::{self, Bridge, ToolBinding, ToolCall, ToolDef, ToolError, DISPATCH_ENTRY};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::{ContextStatus, ExecutionContext};
use crate::sandbox::guard::{check_binding, BindingEvent};
use crate::sandbox::snapshot::{Checkpoint, Snapshot};
use crate::sandbox::stack::CallStack;
use crate::sandbox::transfer::{transfer_in, transfer_out_with};
use crate::sandbox::value::{Transfer, Value};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Result of one `exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Output printed while the code ran.
    pub output: String,
    /// Value of a trailing expression, when it could leave the sandbox.
    pub value: Option<Transfer>,
    /// `repr` of the trailing expression, transferable or not.
    pub display: Option<String>,
    /// The uncaught error, if the code did not complete.
    pub error: Option<ExecError>,
    /// Steps consumed, when the exec was metered.
    pub fuel_consumed: Option<u64>,
}

impl ExecResult {
    /// Check if the code ran to completion.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Check if the step budget ran out.
    pub fn is_fuel_exhausted(&self) -> bool {
        self.error.as_ref().is_some_and(ExecError::is_fuel_exhausted)
    }

    /// Check if the code tried to rebind a protected name.
    pub fn is_protection_violation(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(ExecError::is_protection_violation)
    }

    /// Turn an uncaught error into `Err`, keeping the result otherwise.
    pub fn into_result(self) -> std::result::Result<Self, ExecError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Everything in a registry except the interpreter.
pub(crate) struct RegistryState {
    pub(crate) generation: u64,
    pub(crate) config: SandboxConfig,
    pub(crate) contexts: IndexMap<String, ExecutionContext>,
    pub(crate) retired: HashSet<String>,
    pub(crate) bridge: Bridge,
    pub(crate) stack: CallStack,
    /// An abort raised in a nested frame, to be re-raised in the frame that
    /// dispatched the tool call.
    pub(crate) abort: Option<ExecError>,
}

fn is_abort(error: &ExecError) -> bool {
    matches!(
        error.kind,
        ErrorKind::RecursionLimit | ErrorKind::InstanceBusy | ErrorKind::Host
    )
}

impl RegistryState {
    fn new(config: SandboxConfig) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            config,
            contexts: IndexMap::new(),
            retired: HashSet::new(),
            bridge: Bridge::default(),
            stack: CallStack::new(),
            abort: None,
        }
    }

    pub(crate) fn context(&self, id: &str) -> Result<&ExecutionContext> {
        self.contexts
            .get(id)
            .ok_or_else(|| SandboxError::NoSuchContext(id.to_string()))
    }

    pub(crate) fn context_mut(&mut self, id: &str) -> Result<&mut ExecutionContext> {
        self.contexts
            .get_mut(id)
            .ok_or_else(|| SandboxError::NoSuchContext(id.to_string()))
    }

    /// The context and its ancestors, innermost first.
    fn ancestry<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ExecutionContext> + 'a {
        std::iter::successors(self.contexts.get(id), move |ctx| {
            ctx.parent().and_then(|parent| self.contexts.get(parent))
        })
    }

    /// Resolve a name with live fallthrough to ancestors.
    pub(crate) fn resolve(&self, id: &str, name: &str) -> Option<Value> {
        self.ancestry(id)
            .find_map(|ctx| ctx.get_local(name))
            .cloned()
    }

    fn check(&self, id: &str, name: &str, event: BindingEvent) -> std::result::Result<(), ExecError> {
        check_binding(self.ancestry(id).map(ExecutionContext::guard), id, name, event)
    }

    pub(crate) fn init_local(&mut self, id: &str, parent: Option<&str>) -> Result<()> {
        if id.is_empty() {
            return Err(SandboxError::InvalidName(id.to_string()));
        }
        if self.contexts.contains_key(id)
            || (!self.config.allow_id_reuse && self.retired.contains(id))
        {
            return Err(SandboxError::DuplicateContext(id.to_string()));
        }
        if let Some(parent) = parent {
            if !self.contexts.contains_key(parent) {
                return Err(SandboxError::NoSuchParent(parent.to_string()));
            }
        }
        self.retired.remove(id);
        self.contexts.insert(
            id.to_string(),
            ExecutionContext::new(id, parent.map(str::to_string)),
        );
        debug!(context = id, parent, "context created");
        Ok(())
    }

    /// Direct children of `id`, in creation order.
    pub(crate) fn children(&self, id: &str) -> Vec<String> {
        self.contexts
            .values()
            .filter(|ctx| ctx.parent() == Some(id))
            .map(|ctx| ctx.id().to_string())
            .collect()
    }

    fn collect_postorder(&self, id: &str, out: &mut Vec<String>) {
        for child in self.children(id) {
            self.collect_postorder(&child, out);
        }
        out.push(id.to_string());
    }

    pub(crate) fn destroy(&mut self, id: &str, cascade: bool) -> Result<Vec<String>> {
        self.context(id)?;
        let mut doomed = Vec::new();
        self.collect_postorder(id, &mut doomed);
        if doomed.len() > 1 && !cascade {
            return Err(SandboxError::HasChildren {
                id: id.to_string(),
                children: self.children(id),
            });
        }
        if let Some(running) = doomed.iter().find(|d| self.stack.contains(d)) {
            return Err(SandboxError::ContextRunning(running.clone()));
        }
        for victim in &doomed {
            self.contexts.shift_remove(victim);
            self.retired.insert(victim.clone());
        }
        debug!(context = id, destroyed = doomed.len(), "context destroyed");
        Ok(doomed)
    }

    pub(crate) fn protect(&mut self, id: &str, name: &str) -> Result<bool> {
        let added = self.context_mut(id)?.guard_mut().protect(name);
        debug!(context = id, name, added, "name protected");
        Ok(added)
    }

    pub(crate) fn unprotect(&mut self, id: &str, name: &str) -> Result<bool> {
        let removed = self.context_mut(id)?.guard_mut().unprotect(name);
        debug!(context = id, name, removed, "name unprotected");
        Ok(removed)
    }

    pub(crate) fn assign(
        &mut self,
        interp: &mut dyn Interpreter,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<()> {
        self.context(id)?;
        if !is_identifier(name) {
            return Err(SandboxError::InvalidName(name.to_string()));
        }
        let value = interp.import_value(transfer_in(value)?)?;
        self.context_mut(id)?.bind(name, value);
        Ok(())
    }

    pub(crate) fn fetch(
        &self,
        interp: &mut dyn Interpreter,
        id: &str,
        name: &str,
    ) -> Result<Option<Transfer>> {
        self.context(id)?;
        match self.resolve(id, name) {
            Some(value) => Ok(Some(transfer_out_with(&value, &mut |o| {
                interp.export_opaque(o)
            })?)),
            None => Ok(None),
        }
    }

    fn refresh_status(&mut self, id: &str) {
        let running = self.stack.contains(id);
        if let Some(ctx) = self.contexts.get_mut(id) {
            ctx.set_status(if running {
                ContextStatus::Running
            } else {
                ContextStatus::Idle
            });
        }
    }
}

/// Whether `name` can be bound by sandboxed code.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
        && !is_keyword(name)
}

/// The namespace view handed to the interpreter for one frame.
struct FrameEnv<'s> {
    state: &'s mut RegistryState,
    context_id: &'s str,
}

impl Environment for FrameEnv<'_> {
    fn load(&mut self, name: &str) -> Option<Value> {
        self.state.resolve(self.context_id, name)
    }

    fn store(&mut self, name: &str, value: Value) -> std::result::Result<(), ExecError> {
        self.state.check(self.context_id, name, BindingEvent::Store)?;
        if let Some(ctx) = self.state.contexts.get_mut(self.context_id) {
            ctx.bind(name, value);
        }
        Ok(())
    }

    fn delete(&mut self, name: &str) -> std::result::Result<bool, ExecError> {
        self.state.check(self.context_id, name, BindingEvent::Delete)?;
        Ok(self
            .state
            .contexts
            .get_mut(self.context_id)
            .is_some_and(|ctx| ctx.unbind(name)))
    }

    fn call_host(
        &mut self,
        interpreter: &mut dyn Interpreter,
        function: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ExecError> {
        if function != DISPATCH_ENTRY {
            return Err(ExecError::exception(
                "NameError",
                format!("host function '{function}' is not available"),
            ));
        }
        bridge::dispatch(interpreter, self.state, self.context_id, args)
    }
}

/// Run one frame on the call stack.
pub(crate) fn run_frame(
    interp: &mut dyn Interpreter,
    state: &mut RegistryState,
    id: &str,
    code: &str,
    fuel: Option<u64>,
) -> Result<ExecResult> {
    state.context(id)?;
    let depth = state.stack.depth() + 1;
    if depth > state.config.max_call_depth {
        warn!(context = id, depth, "call depth limit exceeded");
        return Err(SandboxError::RecursionLimit {
            limit: state.config.max_call_depth,
        });
    }
    let nested = depth > 1;
    let outer = interp.step_budget();
    let budget = if nested {
        match (fuel, outer) {
            (Some(own), Some(left)) => Some(own.min(left)),
            (own, left) => own.or(left),
        }
    } else {
        fuel.or(state.config.default_fuel)
    };
    interp.set_step_budget(budget);

    state.stack.push(id);
    state.refresh_status(id);
    let span = debug_span!("exec", context = id, depth);
    let _enter = span.enter();
    debug!(fuel = ?budget, interpreter = interp.name(), "exec started");

    let evaluation = {
        let mut env = FrameEnv {
            state: &mut *state,
            context_id: id,
        };
        interp.evaluate(code, &mut env)
    };

    state.stack.pop();
    state.refresh_status(id);

    let consumed = match (budget, interp.step_budget()) {
        (Some(given), Some(left)) => Some(given.saturating_sub(left)),
        _ => None,
    };
    if nested {
        interp.set_step_budget(match (outer, consumed) {
            (Some(left), Some(used)) => Some(left.saturating_sub(used)),
            (left, _) => left,
        });
    }

    let (value, display) = match &evaluation.value {
        Some(value) => (
            transfer_out_with(value, &mut |o| interp.export_opaque(o)).ok(),
            Some(value.repr()),
        ),
        None => (None, None),
    };
    if let Some(error) = &evaluation.error {
        if error.is_fuel_exhausted() {
            warn!(context = id, fuel = ?budget, "fuel exhausted");
        } else {
            debug!(context = id, error = %error, "exec failed");
        }
        if nested && is_abort(error) {
            state.abort = Some(error.clone());
        }
    }
    debug!(consumed = ?consumed, "exec finished");

    Ok(ExecResult {
        output: evaluation.output,
        value,
        display,
        error: evaluation.error,
        fuel_consumed: consumed,
    })
}

/// A set of execution contexts multiplexed over one interpreter instance.
///
/// # Example
///
/// ```rust
/// use pybox::prelude::*;
///
/// let mut registry = Registry::new(SandboxConfig::default())?;
/// registry.init_local("main", None)?;
/// registry.exec("main", "x = 20")?;
/// let result = registry.exec("main", "x * 2 + 2")?;
/// assert_eq!(result.value, Some(Transfer::Int(42)));
/// # Ok::<(), pybox::SandboxError>(())
/// ```
pub struct Registry {
    interpreter: Box<dyn Interpreter>,
    state: RegistryState,
}

impl Registry {
    /// Create a registry on the built-in script interpreter.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let interpreter = ScriptInterpreter::new(&config);
        Ok(Self::with_interpreter(config, Box::new(interpreter)))
    }

    /// Create a registry on the wasm interpreter at `config.interpreter_path`.
    pub fn wasm(config: SandboxConfig) -> Result<Self> {
        let interpreter = crate::interpreter::WasmInterpreter::new(&config)?;
        Ok(Self::with_interpreter(config, Box::new(interpreter)))
    }

    /// Create a registry on any interpreter.
    pub fn with_interpreter(config: SandboxConfig, mut interpreter: Box<dyn Interpreter>) -> Self {
        interpreter.set_global(DISPATCH_ENTRY, Value::Host(DISPATCH_ENTRY.into()));
        let state = RegistryState::new(config);
        debug!(
            interpreter = interpreter.name(),
            generation = state.generation,
            "registry created"
        );
        Self { interpreter, state }
    }

    /// Create a root context, or a child of `parent`.
    pub fn init_local(&mut self, id: &str, parent: Option<&str>) -> Result<()> {
        self.state.init_local(id, parent)
    }

    /// Run `code` in context `id` under the configured default fuel.
    pub fn exec(&mut self, id: &str, code: &str) -> Result<ExecResult> {
        self.exec_inner(id, code, None)
    }

    /// Run `code` in context `id` with a budget of `fuel` steps.
    pub fn exec_with_fuel(&mut self, id: &str, code: &str, fuel: u64) -> Result<ExecResult> {
        self.exec_inner(id, code, Some(fuel))
    }

    fn exec_inner(&mut self, id: &str, code: &str, fuel: Option<u64>) -> Result<ExecResult> {
        if !self.state.stack.is_empty() {
            return Err(SandboxError::InstanceBusy);
        }
        self.state.abort = None;
        run_frame(self.interpreter.as_mut(), &mut self.state, id, code, fuel)
    }

    /// Register a tool that forwards `*args, **kwargs`.
    pub fn register_tool<F>(&mut self, name: &str, callback: F) -> Result<ToolBinding>
    where
        F: Fn(&mut Session<'_>, ToolCall) -> std::result::Result<Transfer, ToolError> + 'static,
    {
        self.register_tool_def(ToolDef::new(name), callback)
    }

    /// Register a tool with a declared signature and docstring.
    pub fn register_tool_def<F>(&mut self, def: ToolDef, callback: F) -> Result<ToolBinding>
    where
        F: Fn(&mut Session<'_>, ToolCall) -> std::result::Result<Transfer, ToolError> + 'static,
    {
        self.state.bridge.register(def, Rc::new(callback))
    }

    /// Remove a tool. Stubs already installed raise `NameError` when called.
    pub fn unregister_tool(&mut self, name: &str) -> bool {
        self.state.bridge.unregister(name)
    }

    /// A registered tool.
    pub fn tool(&self, name: &str) -> Option<&ToolBinding> {
        self.state.bridge.binding(name)
    }

    /// Protect `name` in context `id`. Returns `false` if it already was.
    pub fn protect(&mut self, id: &str, name: &str) -> Result<bool> {
        self.state.protect(id, name)
    }

    /// Remove protection from `name` in context `id`.
    pub fn unprotect(&mut self, id: &str, name: &str) -> Result<bool> {
        self.state.unprotect(id, name)
    }

    /// Bind a host value in context `id`. The host bypasses protection.
    pub fn assign(&mut self, id: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.state
            .assign(self.interpreter.as_mut(), id, name, &value.into())
    }

    /// Resolve `name` in context `id` and copy it out of the sandbox.
    pub fn fetch(&mut self, id: &str, name: &str) -> Result<Option<Transfer>> {
        self.state.fetch(self.interpreter.as_mut(), id, name)
    }

    /// Capture the state of context `id`.
    pub fn snapshot(&mut self, id: &str) -> Result<Snapshot> {
        self.state.snapshot(self.interpreter.as_mut(), id)
    }

    /// Restore a context from a snapshot, re-creating it if destroyed.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.state.restore(self.interpreter.as_mut(), snapshot)
    }

    /// Capture the interpreter's raw state and every context.
    pub fn checkpoint(&mut self) -> Result<Checkpoint> {
        self.state.checkpoint(self.interpreter.as_mut())
    }

    /// Return the whole instance to a checkpoint.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if !self.state.stack.is_empty() {
            return Err(SandboxError::InstanceBusy);
        }
        self.state.rollback(self.interpreter.as_mut(), checkpoint)
    }

    /// Destroy context `id`; with `cascade`, its descendants first. Returns
    /// the destroyed ids.
    pub fn destroy(&mut self, id: &str, cascade: bool) -> Result<Vec<String>> {
        self.state.destroy(id, cascade)
    }

    /// A context by id.
    pub fn context(&self, id: &str) -> Option<&ExecutionContext> {
        self.state.contexts.get(id)
    }

    /// All contexts in creation order.
    pub fn contexts(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.state.contexts.values()
    }

    /// Direct children of `id`.
    pub fn children(&self, id: &str) -> Vec<String> {
        self.state.children(id)
    }

    /// The instance generation snapshots are bound to.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Number of frames on the call stack.
    pub fn call_depth(&self) -> usize {
        self.state.stack.depth()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.state.config
    }

    pub fn interpreter(&self) -> &dyn Interpreter {
        self.interpreter.as_ref()
    }
}

/// The registry as seen from inside a tool callback.
///
/// Execs made through a session run as nested frames above the suspended
/// caller.
pub struct Session<'a> {
    interpreter: &'a mut dyn Interpreter,
    state: &'a mut RegistryState,
    caller: &'a str,
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        interpreter: &'a mut dyn Interpreter,
        state: &'a mut RegistryState,
        caller: &'a str,
    ) -> Self {
        Self {
            interpreter,
            state,
            caller,
        }
    }

    /// The context whose code called the tool.
    pub fn caller(&self) -> &str {
        self.caller
    }

    /// Frames on the call stack, including the suspended caller.
    pub fn depth(&self) -> usize {
        self.state.stack.depth()
    }

    /// Run `code` in context `id` as a nested frame.
    pub fn exec(&mut self, id: &str, code: &str) -> Result<ExecResult> {
        run_frame(&mut *self.interpreter, self.state, id, code, None)
    }

    /// Run a nested frame with at most `fuel` steps (never more than the
    /// caller has left).
    pub fn exec_with_fuel(&mut self, id: &str, code: &str, fuel: u64) -> Result<ExecResult> {
        run_frame(&mut *self.interpreter, self.state, id, code, Some(fuel))
    }

    pub fn init_local(&mut self, id: &str, parent: Option<&str>) -> Result<()> {
        self.state.init_local(id, parent)
    }

    pub fn protect(&mut self, id: &str, name: &str) -> Result<bool> {
        self.state.protect(id, name)
    }

    pub fn assign(&mut self, id: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.state
            .assign(&mut *self.interpreter, id, name, &value.into())
    }

    pub fn fetch(&mut self, id: &str, name: &str) -> Result<Option<Transfer>> {
        self.state.fetch(&mut *self.interpreter, id, name)
    }

    pub fn snapshot(&mut self, id: &str) -> Result<Snapshot> {
        self.state.snapshot(&mut *self.interpreter, id)
    }

    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.state.restore(&mut *self.interpreter, snapshot)
    }

    /// Destroy a context. Contexts with an active frame cannot be destroyed.
    pub fn destroy(&mut self, id: &str, cascade: bool) -> Result<Vec<String>> {
        self.state.destroy(id, cascade)
    }

    pub fn context(&self, id: &str) -> Option<&ExecutionContext> {
        self.state.contexts.get(id)
    }
}

/// A cloneable handle to a registry for single-threaded hosts.
///
/// Borrowing the registry while an exec is running fails with
/// [`SandboxError::InstanceBusy`]; callbacks use their [`Session`] instead.
#[derive(Clone)]
pub struct SharedRegistry(Rc<RefCell<Registry>>);

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self(Rc::new(RefCell::new(registry)))
    }

    /// Run `f` with exclusive access to the registry.
    pub fn with<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let mut registry = self
            .0
            .try_borrow_mut()
            .map_err(|_| SandboxError::InstanceBusy)?;
        f(&mut registry)
    }

    pub fn init_local(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.with(|r| r.init_local(id, parent))
    }

    pub fn exec(&self, id: &str, code: &str) -> Result<ExecResult> {
        self.with(|r| r.exec(id, code))
    }

    pub fn exec_with_fuel(&self, id: &str, code: &str, fuel: u64) -> Result<ExecResult> {
        self.with(|r| r.exec_with_fuel(id, code, fuel))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry() -> Registry {
        Registry::new(SandboxConfig::default()).unwrap()
    }

    #[test]
    fn test_fallthrough_is_live() {
        let mut reg = registry();
        reg.init_local("p", None).unwrap();
        reg.exec("p", "x = 1").unwrap();
        reg.init_local("c", Some("p")).unwrap();
        reg.exec("c", "y = x + 1").unwrap();
        assert_eq!(reg.fetch("c", "y").unwrap(), Some(Transfer::Int(2)));
        reg.exec("p", "x = 5").unwrap();
        reg.exec("c", "y = x + 1").unwrap();
        assert_eq!(reg.fetch("c", "y").unwrap(), Some(Transfer::Int(6)));
        assert_eq!(reg.fetch("p", "y").unwrap(), None);
    }

    #[test]
    fn test_child_writes_stay_local() {
        let mut reg = registry();
        reg.init_local("p", None).unwrap();
        reg.init_local("c", Some("p")).unwrap();
        reg.exec("p", "x = 1").unwrap();
        reg.exec("c", "x = 2").unwrap();
        assert_eq!(reg.fetch("p", "x").unwrap(), Some(Transfer::Int(1)));
        assert_eq!(reg.fetch("c", "x").unwrap(), Some(Transfer::Int(2)));
    }

    #[test]
    fn test_status_returns_to_idle() {
        let mut reg = registry();
        reg.init_local("a", None).unwrap();
        reg.exec("a", "1 / 0").unwrap();
        assert_eq!(reg.context("a").map(|c| c.status()), Some(ContextStatus::Idle));
        assert_eq!(reg.call_depth(), 0);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("greet"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("for"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_generations_are_distinct() {
        assert_ne!(registry().generation(), registry().generation());
    }

    #[test]
    fn test_display_for_untransferable_value() {
        let mut reg = registry();
        reg.init_local("a", None).unwrap();
        let result = reg.exec("a", "def f():\n    pass\nf").unwrap();
        assert_eq!(result.value, None);
        assert_eq!(result.display.as_deref(), Some("<function f>"));
    }
}
