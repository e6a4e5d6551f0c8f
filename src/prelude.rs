//! Prelude module for convenient imports.

pub use crate::error::{ExecError, Result, SandboxError};
pub use crate::sandbox::{
    bridge::{ToolCall, ToolDef, ToolError},
    config::SandboxConfig,
    registry::{ExecResult, Registry, Session, SharedRegistry},
    snapshot::Snapshot,
    value::{Transfer, Value},
};
