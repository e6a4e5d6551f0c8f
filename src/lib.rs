//! # pybox
//!
//! Multiplexed, protected execution contexts over a single sandboxed Python
//! interpreter.
//!
//! A [`Registry`] owns one interpreter instance and any number of named
//! contexts on it. Each context is an isolated namespace; a child context
//! reads through to its parent's live bindings but writes only to itself.
//! The host can:
//!
//! - **Protect names** so sandboxed code cannot rebind or delete them
//! - **Expose tools**: host callbacks reached through generated proxy functions
//! - **Meter execution** with a step budget per `exec`
//! - **Snapshot and restore** single contexts, or checkpoint the whole instance
//!
//! Tool callbacks run synchronously on the calling thread and may `exec`
//! again through their [`Session`], up to a bounded call depth.
//!
//! ## Example
//!
//! ```rust
//! use pybox::prelude::*;
//!
//! let mut registry = Registry::new(SandboxConfig::default())?;
//! let greet = registry.register_tool("greet", |_, call| {
//!     let name = call.str_arg(0)?;
//!     Ok(Transfer::from(format!("Hello {name}")))
//! })?;
//!
//! registry.init_local("agent", None)?;
//! registry.exec("agent", &greet.stub())?;
//! registry.protect("agent", "greet")?;
//!
//! let result = registry.exec("agent", "greet('pybox')")?;
//! assert_eq!(result.value, Some(Transfer::from("Hello pybox")));
//!
//! let result = registry.exec("agent", "greet = 0")?;
//! assert!(result.is_protection_violation());
//! # Ok::<(), pybox::SandboxError>(())
//! ```
//!
//! ## Interpreters
//!
//! The default [`ScriptInterpreter`] evaluates a Python subset in-process.
//! [`WasmInterpreter`] hosts a reactor module in wasmtime with fuel metering,
//! a memory limit and WASI preview 1 without filesystem access.

pub mod error;
pub mod interpreter;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ErrorKind, ExecError, Result, SandboxError, TransferError};
pub use interpreter::{Environment, Evaluation, Interpreter, ScriptInterpreter, WasmInterpreter};
pub use sandbox::bridge::{ToolBinding, ToolCall, ToolDef, ToolError, DISPATCH_ENTRY};
pub use sandbox::cache::{default_engine, global_cache, ModuleCache, SharedEngine};
pub use sandbox::config::{PreopenDir, SandboxConfig, SandboxConfigBuilder};
pub use sandbox::context::{ContextStatus, ExecutionContext};
pub use sandbox::guard::VariableGuard;
pub use sandbox::registry::{ExecResult, Registry, Session, SharedRegistry};
pub use sandbox::snapshot::{Checkpoint, Snapshot, SNAPSHOT_FORMAT};
pub use sandbox::stack::{CallStack, Frame, FrameState};
pub use sandbox::transfer::{transfer_in, transfer_out, MAX_TRANSFER_DEPTH};
pub use sandbox::value::{Opaque, Transfer, Value};
