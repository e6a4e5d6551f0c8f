//! Tool binding bridge: host callbacks callable from sandboxed code.
//!
//! A registered tool is reached through a proxy function installed in a
//! context by `exec`ing [`ToolBinding::stub`]. The proxy forwards its
//! arguments to the instance-wide gateway `__pybox_dispatch__`, which lands
//! in [`dispatch`]: the calling frame is suspended, arguments are transferred
//! out, the callback runs on the calling thread with a [`Session`], and the
//! result is transferred back in.

use std::fmt::Write as _;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, trace_span};

use crate::error::{ExecError, Result, SandboxError};
use crate::interpreter::Interpreter;
use crate::sandbox::registry::{is_identifier, RegistryState, Session};
use crate::sandbox::transfer::transfer_out_with;
use crate::sandbox::value::{quote_str, Transfer, Value};

/// Name of the gateway global every tool stub calls.
pub const DISPATCH_ENTRY: &str = "__pybox_dispatch__";

/// A host callback behind a tool.
pub type ToolCallback =
    Rc<dyn Fn(&mut Session<'_>, ToolCall) -> std::result::Result<Transfer, ToolError>>;

/// How a tool callback failed.
#[derive(Error, Debug)]
pub enum ToolError {
    /// Raise an exception inside the sandbox. Sandboxed code can catch it.
    #[error("{exc_type}: {message}")]
    Raise {
        /// Exception class name, e.g. `ValueError`.
        exc_type: String,
        /// Exception message.
        message: String,
    },

    /// Unwind the whole call tree. Surfaces as the outermost exec's error.
    #[error(transparent)]
    Abort(#[from] SandboxError),
}

impl ToolError {
    /// Shorthand for [`ToolError::Raise`].
    pub fn raise(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Raise {
            exc_type: exc_type.into(),
            message: message.into(),
        }
    }
}

/// Arguments of one tool call, already copied out of the sandbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Transfer>,
    /// Keyword arguments in call order.
    pub kwargs: IndexMap<String, Transfer>,
}

impl ToolCall {
    /// Positional argument `index`.
    pub fn arg(&self, index: usize) -> Option<&Transfer> {
        self.args.get(index)
    }

    /// Keyword argument `name`.
    pub fn kwarg(&self, name: &str) -> Option<&Transfer> {
        self.kwargs.get(name)
    }

    /// An argument passed either by keyword or at `index`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Transfer> {
        self.kwarg(name).or_else(|| self.arg(index))
    }

    /// Positional argument `index` as text, or a `TypeError` for the sandbox.
    pub fn str_arg(&self, index: usize) -> std::result::Result<&str, ToolError> {
        self.arg(index).and_then(Transfer::as_str).ok_or_else(|| {
            ToolError::raise(
                "TypeError",
                format!("{}() argument {} must be str", self.name, index + 1),
            )
        })
    }
}

/// Declared shape of a tool: name, parameters and docstring.
///
/// Parameters are written as they would appear in a `def`: `"path"`,
/// `"mode='r'"`, `"*rest"`, `"**options"`.
///
/// ```rust
/// use pybox::ToolDef;
///
/// let def = ToolDef::new("greet").params(["name"]).doc("Say hello.");
/// assert_eq!(def.name(), "greet");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDef {
    name: String,
    params: Option<Vec<String>>,
    doc: Option<String>,
}

impl ToolDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
            doc: None,
        }
    }

    /// Declare the parameter list. Without it the stub takes `*args, **kwargs`.
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn docstring(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(SandboxError::InvalidName(self.name.clone()));
        }
        for param in self.params.iter().flatten() {
            if !is_identifier(Param::ident(param)) {
                return Err(SandboxError::InvalidName(param.clone()));
            }
        }
        Ok(())
    }
}

enum Param<'a> {
    Plain(&'a str),
    Star(&'a str),
    KwStar(&'a str),
}

impl<'a> Param<'a> {
    /// Identifier of a parameter spec, without stars or default.
    fn ident(spec: &'a str) -> &'a str {
        let body = spec.trim().trim_start_matches('*');
        match body.split_once('=') {
            Some((name, _)) => name.trim(),
            None => body,
        }
    }

    fn parse(spec: &'a str) -> Self {
        let name = Self::ident(spec);
        let spec = spec.trim();
        if spec.starts_with("**") {
            Param::KwStar(name)
        } else if spec.starts_with('*') {
            Param::Star(name)
        } else {
            Param::Plain(name)
        }
    }
}

/// A registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    def: ToolDef,
}

impl ToolBinding {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &ToolDef {
        &self.def
    }

    fn signature(&self) -> String {
        let params = match &self.def.params {
            Some(params) => params
                .iter()
                .map(|p| p.trim())
                .collect::<Vec<_>>()
                .join(", "),
            None => "*args, **kwargs".to_string(),
        };
        format!("def {}({}):\n", self.def.name, params)
    }

    fn docstring(&self, out: &mut String) {
        if let Some(doc) = &self.def.doc {
            let escaped = doc.replace('\\', "\\\\").replace("\"\"\"", "\\\"\\\"\\\"");
            let _ = writeln!(out, "    \"\"\"{escaped}\"\"\"");
        }
    }

    /// Source of the proxy function to `exec` into a context.
    ///
    /// ```rust
    /// use pybox::prelude::*;
    ///
    /// let mut registry = Registry::new(SandboxConfig::default())?;
    /// let binding = registry.register_tool("add", |_, call| {
    ///     let a = call.arg(0).and_then(Transfer::as_int).unwrap_or(0);
    ///     let b = call.arg(1).and_then(Transfer::as_int).unwrap_or(0);
    ///     Ok(Transfer::Int(a + b))
    /// })?;
    /// registry.init_local("main", None)?;
    /// registry.exec("main", &binding.stub())?;
    /// let result = registry.exec("main", "add(2, 3)")?;
    /// assert_eq!(result.value, Some(Transfer::Int(5)));
    /// # Ok::<(), pybox::SandboxError>(())
    /// ```
    pub fn stub(&self) -> String {
        let mut out = self.signature();
        self.docstring(&mut out);
        let (args, kwargs) = match &self.def.params {
            None => ("list(args)".to_string(), "kwargs".to_string()),
            Some(params) => {
                let mut plain = Vec::new();
                let mut star = None;
                let mut kwstar = None;
                for param in params {
                    match Param::parse(param) {
                        Param::Plain(name) => plain.push(name),
                        Param::Star(name) => star = Some(name),
                        Param::KwStar(name) => kwstar = Some(name),
                    }
                }
                let mut args = format!("[{}]", plain.join(", "));
                if let Some(star) = star {
                    let _ = write!(args, " + list({star})");
                }
                (args, kwstar.unwrap_or("{}").to_string())
            }
        };
        let _ = writeln!(
            out,
            "    return {DISPATCH_ENTRY}({}, {args}, {kwargs})",
            quote_str(&self.def.name)
        );
        out
    }

    /// Signature and docstring without a body, for prompting.
    pub fn decl(&self) -> String {
        let mut out = self.signature();
        if self.def.doc.is_some() {
            self.docstring(&mut out);
        } else {
            out.push_str("    ...\n");
        }
        out
    }
}

struct Tool {
    binding: ToolBinding,
    callback: ToolCallback,
}

/// The tools registered on one registry.
#[derive(Default)]
pub(crate) struct Bridge {
    tools: IndexMap<String, Tool>,
}

impl Bridge {
    pub(crate) fn register(&mut self, def: ToolDef, callback: ToolCallback) -> Result<ToolBinding> {
        def.validate()?;
        if self.tools.contains_key(def.name()) {
            return Err(SandboxError::DuplicateBinding(def.name().to_string()));
        }
        let binding = ToolBinding { def };
        debug!(tool = binding.name(), "tool registered");
        self.tools.insert(
            binding.name().to_string(),
            Tool {
                binding: binding.clone(),
                callback,
            },
        );
        Ok(binding)
    }

    pub(crate) fn unregister(&mut self, name: &str) -> bool {
        let removed = self.tools.shift_remove(name).is_some();
        debug!(tool = name, removed, "tool unregistered");
        removed
    }

    pub(crate) fn binding(&self, name: &str) -> Option<&ToolBinding> {
        self.tools.get(name).map(|tool| &tool.binding)
    }

    fn callback(&self, name: &str) -> Option<ToolCallback> {
        self.tools.get(name).map(|tool| Rc::clone(&tool.callback))
    }
}

fn type_error(message: impl Into<String>) -> ExecError {
    ExecError::exception("TypeError", message)
}

/// Handle a call of the dispatch gateway made by code running in `caller`.
pub(crate) fn dispatch(
    interp: &mut dyn Interpreter,
    state: &mut RegistryState,
    caller: &str,
    args: Vec<Value>,
) -> std::result::Result<Value, ExecError> {
    let [name, args, kwargs]: [Value; 3] = args
        .try_into()
        .map_err(|_| type_error(format!("{DISPATCH_ENTRY}() takes exactly 3 arguments")))?;
    let name = name
        .as_str()
        .ok_or_else(|| type_error("tool name must be str"))?
        .to_string();
    let callback = state.bridge.callback(&name).ok_or_else(|| {
        ExecError::exception("NameError", format!("tool '{name}' is not registered"))
    })?;

    let mut export = |value: &Value| {
        transfer_out_with(value, &mut |o| interp.export_opaque(o))
            .map_err(|err| type_error(format!("{name}(): {err}")))
    };
    let call = ToolCall {
        args: match export(&args)? {
            Transfer::List(items) => items,
            _ => return Err(type_error("tool arguments must be a list")),
        },
        kwargs: match export(&kwargs)? {
            Transfer::Map(entries) => entries,
            _ => return Err(type_error("tool keyword arguments must be a dict")),
        },
        name: name.clone(),
    };

    let span = trace_span!("tool", tool = %name, caller);
    let _enter = span.enter();
    debug!(args = call.args.len(), kwargs = call.kwargs.len(), "dispatching tool call");

    state.stack.suspend(&name);
    let outcome = {
        let mut session = Session::new(&mut *interp, &mut *state, caller);
        callback(&mut session, call)
    };
    state.stack.resume();

    if let Some(abort) = state.abort.take() {
        debug!(error = %abort, "nested frame aborted the call tree");
        return Err(abort);
    }
    match outcome {
        Ok(result) => interp
            .import_value(Value::from(result))
            .map_err(|err| ExecError::from(&err)),
        Err(ToolError::Raise { exc_type, message }) => {
            debug!(%exc_type, "tool raised");
            Err(ExecError::exception(exc_type, message))
        }
        Err(ToolError::Abort(err)) => {
            debug!(error = %err, "tool aborted");
            Err(ExecError::from(&err))
        }
    }
}
