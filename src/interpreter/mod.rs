//! The interpreter capability consumed by the registry.
//!
//! An interpreter evaluates source against an [`Environment`] supplied by the
//! registry. Every top-level name load, store and delete goes through the
//! environment; that is where namespace fallthrough and the variable guard
//! live. Two implementations ship with the crate:
//!
//! - [`ScriptInterpreter`]: an in-process evaluator for a Python subset.
//! - [`WasmInterpreter`]: a reactor module hosted in wasmtime.

pub mod script;
pub mod wasm;

pub use script::ScriptInterpreter;
pub use wasm::WasmInterpreter;

use crate::error::{ExecError, Result, TransferError};
use crate::sandbox::value::{Opaque, Transfer, Value};

/// Outcome of one `evaluate` call.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Output captured while evaluating.
    pub output: String,
    /// Value of a trailing expression statement, unless it was `None`.
    pub value: Option<Value>,
    /// The uncaught error, if evaluation did not complete.
    pub error: Option<ExecError>,
}

impl Evaluation {
    /// An evaluation that failed before producing output.
    pub fn failed(error: ExecError) -> Self {
        Self {
            output: String::new(),
            value: None,
            error: Some(error),
        }
    }
}

/// The active namespace, as seen by an interpreter during `evaluate`.
pub trait Environment {
    /// Resolve a top-level name, with fallthrough to ancestors.
    fn load(&mut self, name: &str) -> Option<Value>;

    /// Bind a top-level name. Fails with a protection violation when the
    /// name is protected.
    fn store(&mut self, name: &str, value: Value) -> std::result::Result<(), ExecError>;

    /// Remove a local binding. Returns `false` if it was not bound locally.
    fn delete(&mut self, name: &str) -> std::result::Result<bool, ExecError>;

    /// Invoke a host gateway. `interpreter` is the caller, handed back so the
    /// host can run nested evaluations on it.
    fn call_host(
        &mut self,
        interpreter: &mut dyn Interpreter,
        function: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ExecError>;
}

/// An opaque sandboxed evaluator.
pub trait Interpreter {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run `source` against `env`.
    fn evaluate(&mut self, source: &str, env: &mut dyn Environment) -> Evaluation;

    /// Read an instance-wide global.
    fn get_global(&self, name: &str) -> Option<Value>;

    /// Set an instance-wide global, visible from every context.
    fn set_global(&mut self, name: &str, value: Value);

    /// Set the step budget for subsequent evaluation. `None` is unmetered.
    fn set_step_budget(&mut self, steps: Option<u64>);

    /// Steps left, if metered.
    fn step_budget(&self) -> Option<u64>;

    /// Save the interpreter's raw state.
    fn save_raw_state(&self) -> Result<Vec<u8>>;

    /// Load raw state saved by [`save_raw_state`](Self::save_raw_state).
    fn load_raw_state(&mut self, raw: &[u8]) -> Result<()>;

    /// Take in a transfer-safe host value. Interpreters with their own heap
    /// may move it there and return a handle.
    fn import_value(&mut self, value: Value) -> Result<Value> {
        Ok(value)
    }

    /// Materialize an opaque value as a transfer tree, if this interpreter
    /// knows how. `None` means the value is not transferable.
    fn export_opaque(
        &mut self,
        value: &Opaque,
    ) -> Option<std::result::Result<Transfer, TransferError>> {
        let _ = value;
        None
    }
}
