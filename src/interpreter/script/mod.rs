//! In-process interpreter for a Python subset.
//!
//! Covers what tool-calling snippets need: functions and lambdas, closures,
//! `if`/`while`/`for`, `try`/`except`/`finally`, comprehensions, f-strings,
//! lists, dicts and the common builtins and methods. `import`, classes and
//! generators are not available.
//!
//! Every statement, loop iteration and call consumes one step of the step
//! budget. Running out raises an uncatchable `FuelExhausted`.

mod ast;
mod builtins;
mod eval;
mod lexer;
mod objects;
mod ops;
mod parser;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ExecError, Result};
use crate::interpreter::{Environment, Evaluation, Interpreter};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::io::CapturedOutput;
use crate::sandbox::limits::StepBudget;
use crate::sandbox::transfer::transfer_out;
use crate::sandbox::value::{Transfer, Value};

use eval::Machine;
use objects::{builtin_value, class_value, EXCEPTION_CLASSES};

pub(crate) use parser::is_keyword;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScriptLimits {
    pub max_recursion_depth: usize,
    pub max_collection_len: usize,
}

/// A global installed by the host, as saved in raw state.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum RawGlobal {
    Host(String),
    Data(Transfer),
}

/// The in-process script interpreter.
pub struct ScriptInterpreter {
    globals: IndexMap<String, Value>,
    /// Names set through `set_global`, as opposed to builtins.
    installed: IndexSet<String>,
    budget: StepBudget,
    output: CapturedOutput,
    limits: ScriptLimits,
    /// Sandboxed call depth, shared by nested evaluations.
    depth: usize,
}

impl ScriptInterpreter {
    /// Create an interpreter with the limits from `config`.
    pub fn new(config: &SandboxConfig) -> Self {
        let mut interpreter = Self {
            globals: IndexMap::new(),
            installed: IndexSet::new(),
            budget: StepBudget::default(),
            output: CapturedOutput::new(config.max_output_bytes),
            limits: ScriptLimits {
                max_recursion_depth: config.max_recursion_depth,
                max_collection_len: config.max_collection_len,
            },
            depth: 0,
        };
        for (name, _) in EXCEPTION_CLASSES {
            interpreter.install_builtin(name);
        }
        for (name, _) in builtins::BUILTINS {
            interpreter.install_builtin(name);
        }
        interpreter
    }

    fn install_builtin(&mut self, name: &str) {
        if let Some((name, func)) = builtins::BUILTINS.iter().find(|(n, _)| *n == name) {
            self.globals.insert(name.to_string(), builtin_value(name, *func));
        } else if EXCEPTION_CLASSES.iter().any(|(class, _)| *class == name) {
            self.globals.insert(name.to_string(), class_value(name));
        }
    }

    fn uninstall(&mut self, name: &str) {
        self.globals.shift_remove(name);
        self.install_builtin(name);
    }
}

impl Default for ScriptInterpreter {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

fn syntax_error(error: &lexer::SyntaxError) -> ExecError {
    ExecError::exception("SyntaxError", error.message.clone()).with_traceback(format!(
        "  File \"<sandbox>\", line {}\nSyntaxError: {}",
        error.line, error.message
    ))
}

impl Interpreter for ScriptInterpreter {
    fn name(&self) -> &str {
        "script"
    }

    fn evaluate(&mut self, source: &str, env: &mut dyn Environment) -> Evaluation {
        let body = match parser::parse_module(source) {
            Ok(body) => body,
            Err(error) => return Evaluation::failed(syntax_error(&error)),
        };
        trace!(statements = body.len(), depth = self.depth, "evaluating script");
        self.output.begin();
        let result = Machine::new(self, env).run_module(&body);
        let output = self.output.finish();
        match result {
            Ok(value) => Evaluation {
                output,
                value,
                error: None,
            },
            Err(error) => Evaluation {
                output,
                value: None,
                error: Some(error),
            },
        }
    }

    fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
        self.installed.insert(name.to_string());
    }

    fn set_step_budget(&mut self, steps: Option<u64>) {
        self.budget.set(steps);
    }

    fn step_budget(&self) -> Option<u64> {
        self.budget.remaining()
    }

    fn save_raw_state(&self) -> Result<Vec<u8>> {
        let mut saved = IndexMap::new();
        for name in &self.installed {
            match self.globals.get(name) {
                Some(Value::Host(function)) => {
                    saved.insert(name.clone(), RawGlobal::Host(function.to_string()));
                }
                Some(value) => {
                    if let Ok(data) = transfer_out(value) {
                        saved.insert(name.clone(), RawGlobal::Data(data));
                    }
                }
                None => {}
            }
        }
        Ok(serde_json::to_vec(&saved)?)
    }

    fn load_raw_state(&mut self, raw: &[u8]) -> Result<()> {
        let saved: IndexMap<String, RawGlobal> = serde_json::from_slice(raw)?;
        for name in std::mem::take(&mut self.installed) {
            self.uninstall(&name);
        }
        for (name, global) in saved {
            let value = match global {
                RawGlobal::Host(function) => Value::Host(function.into()),
                RawGlobal::Data(data) => Value::from(data),
            };
            self.set_global(&name, value);
        }
        Ok(())
    }
}
