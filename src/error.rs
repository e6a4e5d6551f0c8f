//! Error types for the context registry and the code running inside it.
//!
//! Two layers of failure exist. [`SandboxError`] is returned directly by host
//! API calls that could not be carried out at all. [`ExecError`] is data: it
//! describes what went wrong while sandboxed code was running and travels
//! inside an [`ExecResult`](crate::ExecResult).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned directly by registry operations.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A context with this id already exists, or existed and reuse is off.
    #[error("context '{0}' already exists")]
    DuplicateContext(String),

    /// The context does not exist.
    #[error("no such context: '{0}'")]
    NoSuchContext(String),

    /// The requested parent context does not exist.
    #[error("no such parent context: '{0}'")]
    NoSuchParent(String),

    /// The context still has children and cascade was not requested.
    #[error("context '{id}' still has children: {children:?}")]
    HasChildren {
        /// The context that was asked to be destroyed.
        id: String,
        /// Its direct children.
        children: Vec<String>,
    },

    /// The context has a frame on the active call stack.
    #[error("context '{0}' has an active frame on the call stack")]
    ContextRunning(String),

    /// Another execution is active on the shared instance.
    #[error("interpreter instance is busy with another execution")]
    InstanceBusy,

    /// Nested re-entry went deeper than the configured call depth.
    #[error("call depth limit of {limit} exceeded")]
    RecursionLimit {
        /// The configured `max_call_depth`.
        limit: usize,
    },

    /// A tool with this name is already registered.
    #[error("tool '{0}' is already registered")]
    DuplicateBinding(String),

    /// The name is not a valid identifier.
    #[error("'{0}' is not a valid identifier")]
    InvalidName(String),

    /// A value could not cross the sandbox boundary.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A snapshot or checkpoint does not belong to this instance.
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Generation (or format version) of the live instance.
        expected: u64,
        /// Generation (or format version) recorded in the snapshot.
        found: u64,
    },

    /// A snapshot record could not be encoded or decoded.
    #[error("invalid snapshot record: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// The interpreter capability could not save or load its raw state.
    #[error("interpreter state error: {0}")]
    RawState(String),

    /// A host-initiated call into the wasm guest failed.
    #[error("guest call failed: {0}")]
    Guest(String),

    /// The interpreter exceeded its memory limit.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// Failed to initialize the Wasm runtime.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// Failed to load or instantiate the interpreter module.
    #[error("failed to load interpreter: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The interpreter wasm file was not found.
    #[error("interpreter wasm not found at: {0}")]
    InterpreterNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Check if this error means the instance was busy.
    pub fn is_instance_busy(&self) -> bool {
        matches!(self, SandboxError::InstanceBusy)
    }

    /// Check if this error is a call depth overflow.
    pub fn is_recursion_limit(&self) -> bool {
        matches!(self, SandboxError::RecursionLimit { .. })
    }

    /// Check if this error names a missing context or parent.
    pub fn is_missing_context(&self) -> bool {
        matches!(
            self,
            SandboxError::NoSuchContext(_) | SandboxError::NoSuchParent(_)
        )
    }

    /// Check if this error is a transfer failure.
    pub fn is_transfer(&self) -> bool {
        matches!(self, SandboxError::Transfer(_))
    }

    /// Check if this error is a snapshot version mismatch.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, SandboxError::VersionMismatch { .. })
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failures of the object transfer codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The value (or something inside it) is not transfer-safe.
    #[error("cannot transfer value of type '{type_name}' at {path}")]
    UnsupportedType {
        /// Type name of the offending value.
        type_name: String,
        /// Location inside the value, e.g. `$[2]['key']`.
        path: String,
    },

    /// The value contains itself.
    #[error("cyclic reference at {path}")]
    CyclicReference {
        /// Location at which the cycle closes.
        path: String,
    },

    /// The value nests deeper than the codec allows.
    #[error("value nests deeper than {limit} levels")]
    TooDeep {
        /// The depth limit.
        limit: usize,
    },
}

/// Category of an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A binding to a protected name was rejected.
    ProtectionViolation,
    /// An ordinary exception raised by sandboxed code or a tool.
    Execution,
    /// The step budget ran out.
    FuelExhausted,
    /// Nested re-entry exceeded the call depth limit.
    RecursionLimit,
    /// A tool tried to start an execution that is not bridge-mediated.
    InstanceBusy,
    /// A tool aborted the call tree with a host error.
    Host,
}

impl ErrorKind {
    /// Whether sandboxed `try`/`except` may intercept this kind.
    pub fn is_catchable(self) -> bool {
        matches!(self, ErrorKind::ProtectionViolation | ErrorKind::Execution)
    }
}

/// An error raised while sandboxed code was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    /// Category of the failure.
    pub kind: ErrorKind,
    /// Exception class name as seen from inside the sandbox.
    pub exception_type: String,
    /// Exception message.
    pub message: String,
    /// Rendered traceback, if the interpreter produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            exception_type: exception_type.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// An ordinary, catchable exception.
    pub fn exception(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, exception_type, message)
    }

    /// A rejected binding to a protected name.
    pub fn protection_violation(name: &str) -> Self {
        Self::new(
            ErrorKind::ProtectionViolation,
            "ProtectionViolation",
            format!("Cannot modify protected name '{name}'"),
        )
    }

    /// The step budget ran out.
    pub fn fuel_exhausted() -> Self {
        Self::new(ErrorKind::FuelExhausted, "FuelExhausted", "step budget exhausted")
    }

    /// Attach a rendered traceback.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Parse a Python-style traceback, as written to stderr by a guest
    /// interpreter, into a structured error.
    pub fn from_traceback(stderr: &str) -> Option<Self> {
        parse_python_exception(stderr)
    }

    /// Whether sandboxed `try`/`except` may intercept this error.
    pub fn is_catchable(&self) -> bool {
        self.kind.is_catchable()
    }

    /// Check if this error is a protection violation.
    pub fn is_protection_violation(&self) -> bool {
        self.kind == ErrorKind::ProtectionViolation
    }

    /// Check if this error represents an out-of-fuel condition.
    pub fn is_fuel_exhausted(&self) -> bool {
        self.kind == ErrorKind::FuelExhausted
    }

    /// Check if this error is a call depth overflow.
    pub fn is_recursion_limit(&self) -> bool {
        self.kind == ErrorKind::RecursionLimit
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.exception_type)
        } else {
            write!(f, "{}: {}", self.exception_type, self.message)
        }
    }
}

impl std::error::Error for ExecError {}

impl From<&SandboxError> for ExecError {
    fn from(err: &SandboxError) -> Self {
        let kind = match err {
            SandboxError::RecursionLimit { .. } => ErrorKind::RecursionLimit,
            SandboxError::InstanceBusy => ErrorKind::InstanceBusy,
            _ => ErrorKind::Host,
        };
        let exception_type = match err {
            SandboxError::RecursionLimit { .. } => "RecursionLimit",
            SandboxError::InstanceBusy => "InstanceBusy",
            _ => "HostError",
        };
        ExecError::new(kind, exception_type, err.to_string())
    }
}

/// Parse a Python exception from stderr output.
fn parse_python_exception(stderr: &str) -> Option<ExecError> {
    if stderr.trim().is_empty() {
        return None;
    }

    let lines: Vec<&str> = stderr.lines().collect();

    // The exception line is the last unindented line that names an exception.
    let mut exception_line = None;
    let mut traceback_start = None;

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        } else if !line.starts_with(' ') && !line.is_empty() && looks_like_exception(line) {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (exception_type, message) = match exception_str.find(':') {
        Some(colon_pos) => (
            exception_str[..colon_pos].trim().to_string(),
            exception_str[colon_pos + 1..].trim().to_string(),
        ),
        None => (exception_str.trim().to_string(), String::new()),
    };

    let kind = if exception_type == "ProtectionViolation" {
        ErrorKind::ProtectionViolation
    } else {
        ErrorKind::Execution
    };
    let traceback = traceback_start.map(|start| lines[start..=line_idx].join("\n"));

    Some(ExecError {
        kind,
        exception_type,
        message,
        traceback,
    })
}

/// Check if a line looks like a Python exception.
fn looks_like_exception(line: &str) -> bool {
    const SUFFIXES: [&str; 4] = ["Error", "Exception", "Warning", "Violation"];
    const STANDALONE: [&str; 4] = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    if !line.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        return false;
    }

    let ends_name = |at: usize| at >= line.len() || matches!(line.as_bytes()[at], b':' | b' ');

    // The name must be a single dotted identifier before the first colon.
    let head = line.split(':').next().unwrap_or(line);
    if head.contains(' ') {
        return false;
    }

    SUFFIXES
        .iter()
        .filter_map(|suffix| head.find(suffix).map(|idx| idx + suffix.len()))
        .any(ends_name)
        || STANDALONE
            .iter()
            .any(|exc| line.starts_with(exc) && ends_name(exc.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_exception() {
        let err = ExecError::from_traceback("ValueError: invalid literal for int() with base 10: 'abc'")
            .expect("exception line");

        assert_eq!(err.exception_type, "ValueError");
        assert_eq!(err.message, "invalid literal for int() with base 10: 'abc'");
        assert_eq!(err.kind, ErrorKind::Execution);
        assert!(err.traceback.is_none());
    }

    #[test]
    fn test_parse_exception_with_traceback() {
        let stderr = r#"Traceback (most recent call last):
  File "<sandbox>", line 1, in <module>
ValueError: invalid value"#;

        let err = ExecError::from_traceback(stderr).expect("exception line");
        assert_eq!(err.exception_type, "ValueError");
        assert_eq!(err.message, "invalid value");
        assert!(err.traceback.unwrap().starts_with("Traceback"));
    }

    #[test]
    fn test_parse_protection_violation_kind() {
        let err = ExecError::from_traceback("ProtectionViolation: Cannot modify protected name 'x'")
            .expect("exception line");
        assert!(err.is_protection_violation());
        assert!(err.is_catchable());
    }

    #[test]
    fn test_parse_exception_no_message() {
        let err = ExecError::from_traceback("StopIteration").expect("exception line");
        assert_eq!(err.exception_type, "StopIteration");
        assert!(err.message.is_empty());
    }

    #[test]
    fn test_parse_ignores_plain_output() {
        assert!(ExecError::from_traceback("").is_none());
        assert!(ExecError::from_traceback("   ").is_none());
        assert!(ExecError::from_traceback("Hello world: no Error here").is_none());
    }

    #[test]
    fn test_catchable_kinds() {
        assert!(ErrorKind::Execution.is_catchable());
        assert!(ErrorKind::ProtectionViolation.is_catchable());
        assert!(!ErrorKind::FuelExhausted.is_catchable());
        assert!(!ErrorKind::RecursionLimit.is_catchable());
        assert!(!ErrorKind::InstanceBusy.is_catchable());
        assert!(!ErrorKind::Host.is_catchable());
    }

    #[test]
    fn test_from_sandbox_error() {
        let err = ExecError::from(&SandboxError::RecursionLimit { limit: 4 });
        assert!(err.is_recursion_limit());
        assert_eq!(err.message, "call depth limit of 4 exceeded");

        let err = ExecError::from(&SandboxError::NoSuchContext("gone".into()));
        assert_eq!(err.kind, ErrorKind::Host);
    }

    #[test]
    fn test_error_helpers() {
        assert!(SandboxError::InstanceBusy.is_instance_busy());
        assert!(SandboxError::NoSuchParent("p".into()).is_missing_context());
        assert!(!SandboxError::DuplicateContext("a".into()).is_missing_context());
        assert!(SandboxError::VersionMismatch { expected: 1, found: 2 }.is_version_mismatch());
        assert!(SandboxError::MemoryLimitExceeded("test".into()).is_memory_limit());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExecError::exception("KeyError", "'a'").to_string(), "KeyError: 'a'");
        assert_eq!(ExecError::exception("StopIteration", "").to_string(), "StopIteration");
    }
}
