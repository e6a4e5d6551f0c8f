//! Wasm interpreter capability: a reactor module hosted in wasmtime.
//!
//! The guest is instantiated once and kept alive, so its heap persists
//! between evaluations. It runs under WASI preview 1 with no arguments and
//! no inherited environment. Only the directories listed in
//! [`SandboxConfig::preopen_dirs`] are visible to it. Fuel metering
//! backs the step budget and a [`SandboxLimiter`] caps linear memory.
//!
//! # Guest ABI
//!
//! Exports:
//!
//! - `memory`
//! - `sandbox_alloc(len) -> ptr`
//! - `sandbox_eval(ptr, len) -> packed`: start evaluating the UTF-8 source
//! - `sandbox_resume(ptr, len) -> packed`: deliver the reply to the last request
//! - optional `_initialize`, `sandbox_import(ptr, len) -> handle`,
//!   `sandbox_export(handle) -> packed`, `sandbox_cancel()` and
//!   `sandbox_free(ptr, len)`
//!
//! Imports: `sandbox.output(ptr, len)` appends to the captured output.
//!
//! A `packed` result is `ptr << 32 | len` of a JSON request in guest memory.
//! Evaluation is a trampoline: the guest yields `load`, `store`, `delete`
//! and `call` requests until it yields `done`, and the host answers each
//! one through `sandbox_resume`. A `call` may start a nested `sandbox_eval`
//! before it is answered, so the guest keeps a stack of evaluations;
//! `sandbox_cancel` drops the innermost one after a trap or a malformed
//! request.
//!
//! Buffers handed to the guest and buffers it returns are released with
//! `sandbox_free` once the call that used them has returned, so the guest
//! copies anything it keeps. Without the export they are never released.

use std::fmt::Display;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use wasmtime::{Caller, Instance, Linker, Memory, Module, Store, Trap, TypedFunc};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::error::{ErrorKind, ExecError, Result, SandboxError, TransferError};
use crate::interpreter::{Environment, Evaluation, Interpreter};
use crate::sandbox::cache::{default_engine, global_cache, SharedEngine};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::io::CapturedOutput;
use crate::sandbox::limits::SandboxLimiter;
use crate::sandbox::transfer::MAX_TRANSFER_DEPTH;
use crate::sandbox::value::{Opaque, Transfer, Value};

/// Fuel granted to host-initiated guest calls such as imports and exports.
const HOST_CALL_FUEL: u64 = 50_000_000;
const UNMETERED: u64 = u64::MAX;
const WASM_PAGE: u64 = 64 * 1024;

struct StoreData {
    wasi: WasiP1Ctx,
    limiter: SandboxLimiter,
    output: CapturedOutput,
}

/// Handle to an object in the guest heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestHandle(pub u32);

fn handle_value(handle: u32) -> Value {
    Value::Opaque(Opaque::new("guest object", GuestHandle(handle)).with_label(handle.to_string()))
}

/// A value as exchanged with the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Wire {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Wire>),
    Dict(IndexMap<String, Wire>),
    /// A host gateway, called back through a `call` request.
    Host(String),
    /// A guest heap object.
    Handle(u32),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Load {
        name: String,
    },
    Store {
        name: String,
        value: Wire,
    },
    Delete {
        name: String,
    },
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Wire>,
    },
    Done {
        #[serde(default)]
        value: Option<Wire>,
        #[serde(default)]
        error: Option<ExecError>,
        /// Python-style traceback text, for guests that only report stderr.
        #[serde(default)]
        stderr: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
enum Reply {
    Value { value: Wire },
    Missing,
    Stored,
    Deleted { existed: bool },
    Error { error: ExecError },
}

#[derive(Serialize, Deserialize)]
struct RawHeader {
    globals: IndexMap<String, Wire>,
}

/// Convert a value for the guest.
pub fn to_wire(value: &Value) -> std::result::Result<Wire, ExecError> {
    to_wire_at(value, 0)
}

fn to_wire_at(value: &Value, depth: usize) -> std::result::Result<Wire, ExecError> {
    if depth > MAX_TRANSFER_DEPTH {
        return Err(ExecError::exception(
            "ValueError",
            format!("value nests deeper than {MAX_TRANSFER_DEPTH} levels"),
        ));
    }
    Ok(match value {
        Value::None => Wire::None,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::Int(*i),
        Value::Float(f) => Wire::Float(*f),
        Value::Str(s) => Wire::Str(s.to_string()),
        Value::List(items) => Wire::List(
            items
                .borrow()
                .iter()
                .map(|item| to_wire_at(item, depth + 1))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Dict(entries) => Wire::Dict(
            entries
                .borrow()
                .iter()
                .map(|(key, item)| -> std::result::Result<_, ExecError> {
                    Ok((key.clone(), to_wire_at(item, depth + 1)?))
                })
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Host(name) => Wire::Host(name.to_string()),
        Value::Opaque(opaque) => match opaque.downcast_ref::<GuestHandle>() {
            Some(handle) => Wire::Handle(handle.0),
            None => {
                return Err(ExecError::exception(
                    "TypeError",
                    format!("{} cannot be passed to the guest", opaque.repr()),
                ))
            }
        },
    })
}

/// Convert a guest value for the host.
pub fn from_wire(wire: Wire) -> Value {
    match wire {
        Wire::None => Value::None,
        Wire::Bool(b) => Value::Bool(b),
        Wire::Int(i) => Value::Int(i),
        Wire::Float(f) => Value::Float(f),
        Wire::Str(s) => Value::str(s),
        Wire::List(items) => Value::list(items.into_iter().map(from_wire).collect()),
        Wire::Dict(entries) => {
            Value::dict(entries.into_iter().map(|(k, v)| (k, from_wire(v))).collect())
        }
        Wire::Host(name) => Value::Host(name.into()),
        Wire::Handle(handle) => handle_value(handle),
    }
}

fn wire_to_transfer(wire: Wire, path: &mut String) -> std::result::Result<Transfer, TransferError> {
    let unsupported = |type_name: &str, path: &str| TransferError::UnsupportedType {
        type_name: type_name.to_string(),
        path: path.to_string(),
    };
    Ok(match wire {
        Wire::None => Transfer::None,
        Wire::Bool(b) => Transfer::Bool(b),
        Wire::Int(i) => Transfer::Int(i),
        Wire::Float(f) => Transfer::Float(f),
        Wire::Str(s) => Transfer::Str(s),
        Wire::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{index}]"));
                out.push(wire_to_transfer(item, path)?);
                path.truncate(len);
            }
            Transfer::List(out)
        }
        Wire::Dict(entries) => {
            let mut out = IndexMap::with_capacity(entries.len());
            for (key, item) in entries {
                let len = path.len();
                path.push_str(&format!("[{key:?}]"));
                let item = wire_to_transfer(item, path)?;
                path.truncate(len);
                out.insert(key, item);
            }
            Transfer::Map(out)
        }
        Wire::Host(_) => return Err(unsupported("builtin_function", path.as_str())),
        Wire::Handle(_) => return Err(unsupported("guest object", path.as_str())),
    })
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

fn read_bytes(data: &[u8], ptr: u32, len: u32) -> anyhow::Result<&[u8]> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| anyhow::anyhow!("guest buffer {ptr}+{len} is out of bounds"))?;
    Ok(&data[start..end])
}

fn guest_output(mut caller: Caller<'_, StoreData>, ptr: u32, len: u32) -> anyhow::Result<()> {
    let memory = caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest exports no memory"))?;
    let bytes = read_bytes(memory.data(&caller), ptr, len)?.to_vec();
    caller.data_mut().output.write_bytes(&bytes);
    Ok(())
}

fn protocol_error(err: impl Display) -> ExecError {
    ExecError::new(ErrorKind::Host, "GuestProtocolError", err.to_string())
}

fn module_error(context: &str, err: impl Display) -> SandboxError {
    SandboxError::ModuleLoad(anyhow::anyhow!("{}: {}", context, err))
}

struct Exports {
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    eval: TypedFunc<(u32, u32), u64>,
    resume: TypedFunc<(u32, u32), u64>,
    import: Option<TypedFunc<(u32, u32), u32>>,
    export: Option<TypedFunc<u32, u64>>,
    cancel: Option<TypedFunc<(), ()>>,
    free: Option<TypedFunc<(u32, u32), ()>>,
}

impl Exports {
    fn resolve(store: &mut Store<StoreData>, instance: &Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| module_error("missing export", "memory"))?;
        Ok(Self {
            memory,
            alloc: instance
                .get_typed_func(&mut *store, "sandbox_alloc")
                .map_err(|e| module_error("missing export sandbox_alloc", e))?,
            eval: instance
                .get_typed_func(&mut *store, "sandbox_eval")
                .map_err(|e| module_error("missing export sandbox_eval", e))?,
            resume: instance
                .get_typed_func(&mut *store, "sandbox_resume")
                .map_err(|e| module_error("missing export sandbox_resume", e))?,
            import: instance.get_typed_func(&mut *store, "sandbox_import").ok(),
            export: instance.get_typed_func(&mut *store, "sandbox_export").ok(),
            cancel: instance.get_typed_func(&mut *store, "sandbox_cancel").ok(),
            free: instance.get_typed_func(&mut *store, "sandbox_free").ok(),
        })
    }
}

/// An interpreter running inside a wasm guest.
pub struct WasmInterpreter {
    store: Store<StoreData>,
    exports: Exports,
    globals: IndexMap<String, Value>,
    metered: bool,
}

impl WasmInterpreter {
    /// Load the module at `config.interpreter_path` on the default engine,
    /// through the global module cache.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let engine = default_engine()?;
        let module = global_cache().get_or_compile(&engine, &config.interpreter_path)?;
        Self::from_module(config, &engine, &module)
    }

    /// Compile and instantiate a module from binary or text format.
    pub fn from_bytes(config: &SandboxConfig, engine: &SharedEngine, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let module = Module::new(engine.engine(), bytes.as_ref())
            .map_err(|e| module_error("failed to compile module", e))?;
        Self::from_module(config, engine, &module)
    }

    /// Instantiate an already compiled module.
    pub fn from_module(config: &SandboxConfig, engine: &SharedEngine, module: &Module) -> Result<Self> {
        let mut builder = WasiCtxBuilder::new();
        for dir in &config.preopen_dirs {
            let (dir_perms, file_perms) = if dir.read_only {
                (DirPerms::READ, FilePerms::READ)
            } else {
                (DirPerms::all(), FilePerms::all())
            };
            builder
                .preopened_dir(&dir.host_path, &dir.guest_path, dir_perms, file_perms)
                .map_err(|e| {
                    SandboxError::RuntimeInit(anyhow::anyhow!(
                        "failed to preopen {}: {}",
                        dir.host_path.display(),
                        e
                    ))
                })?;
            debug!(
                host = %dir.host_path.display(),
                guest = %dir.guest_path,
                read_only = dir.read_only,
                "directory preopened"
            );
        }
        let wasi = builder.build_p1();
        let data = StoreData {
            wasi,
            limiter: SandboxLimiter::new(config.max_memory),
            output: CapturedOutput::new(config.max_output_bytes),
        };
        let mut store = Store::new(engine.engine(), data);
        store.limiter(|data| &mut data.limiter);
        store
            .set_fuel(HOST_CALL_FUEL)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to set fuel: {}", e)))?;

        let mut linker = Linker::new(engine.engine());
        preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to link WASI: {}", e)))?;
        linker
            .func_wrap("sandbox", "output", guest_output)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to link sandbox.output: {}", e)))?;

        let instance = linker.instantiate(&mut store, module).map_err(|e| {
            if store.data().limiter.limit_exceeded() {
                return SandboxError::MemoryLimitExceeded(
                    "memory limit exceeded during instantiation".to_string(),
                );
            }
            module_error("failed to instantiate", e)
        })?;
        let exports = Exports::resolve(&mut store, &instance)?;
        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| module_error("guest initialization failed", e))?;
        }
        store
            .set_fuel(UNMETERED)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to set fuel: {}", e)))?;
        debug!(
            memory = exports.memory.data_size(&store),
            import = exports.import.is_some(),
            export = exports.export.is_some(),
            "wasm interpreter instantiated"
        );

        Ok(Self {
            store,
            exports,
            globals: IndexMap::new(),
            metered: false,
        })
    }

    /// Peak guest memory observed so far, in bytes.
    pub fn peak_memory(&self) -> u64 {
        self.store.data().limiter.peak_memory()
    }

    fn write_guest(&mut self, bytes: &[u8]) -> anyhow::Result<(u32, u32)> {
        let len = u32::try_from(bytes.len())?;
        let ptr = self.exports.alloc.call(&mut self.store, len)?;
        self.exports
            .memory
            .write(&mut self.store, ptr as usize, bytes)?;
        Ok((ptr, len))
    }

    /// Copy a guest-produced buffer out and release it.
    fn take_guest(&mut self, packed: u64) -> anyhow::Result<Vec<u8>> {
        let (ptr, len) = unpack(packed);
        let bytes = read_bytes(self.exports.memory.data(&self.store), ptr, len)?.to_vec();
        self.release(ptr, len);
        Ok(bytes)
    }

    fn release(&mut self, ptr: u32, len: u32) {
        let Some(free) = self.exports.free.clone() else {
            return;
        };
        if let Err(err) = self.host_call(|this| Ok(free.call(&mut this.store, (ptr, len))?)) {
            warn!(error = %err, ptr, len, "sandbox_free failed");
        }
    }

    fn call_with(&mut self, func: &TypedFunc<(u32, u32), u64>, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        let (ptr, len) = self.write_guest(bytes)?;
        let packed = func.call(&mut self.store, (ptr, len))?;
        self.release(ptr, len);
        self.take_guest(packed)
    }

    /// Run a host-initiated guest call on its own fuel, keeping the budget.
    fn host_call<T>(&mut self, f: impl FnOnce(&mut Self) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let saved = self.store.get_fuel()?;
        self.store.set_fuel(HOST_CALL_FUEL)?;
        let result = f(self);
        self.store.set_fuel(saved)?;
        result
    }

    /// Classify a failed guest call and drop the evaluation it interrupted.
    fn guest_failure(&mut self, error: anyhow::Error) -> ExecError {
        let failure = if matches!(error.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
            ExecError::fuel_exhausted()
        } else if self.store.data().limiter.limit_exceeded() {
            ExecError::new(ErrorKind::Host, "MemoryError", "guest memory limit exceeded")
        } else {
            warn!(error = %error, "guest trapped");
            ExecError::new(ErrorKind::Host, "GuestTrap", error.to_string())
        };
        self.cancel();
        self.store.data_mut().limiter.reset();
        failure
    }

    /// Drop the innermost guest evaluation.
    fn cancel(&mut self) {
        if let Some(cancel) = self.exports.cancel.clone() {
            if let Err(err) = self.host_call(|this| cancel.call(&mut this.store, ())) {
                warn!(error = %err, "sandbox_cancel failed");
            }
        }
    }

    fn protocol_failure(&mut self, err: impl Display) -> ExecError {
        warn!(error = %err, "malformed guest request");
        self.cancel();
        protocol_error(err)
    }

    fn reply_with(&self, value: std::result::Result<Value, ExecError>) -> Reply {
        match value.and_then(|value| to_wire(&value)) {
            Ok(value) => Reply::Value { value },
            Err(error) => Reply::Error { error },
        }
    }

    fn drive(
        &mut self,
        source: &str,
        env: &mut dyn Environment,
    ) -> std::result::Result<Option<Value>, ExecError> {
        let eval = self.exports.eval.clone();
        let resume = self.exports.resume.clone();
        let mut message = match self.call_with(&eval, source.as_bytes()) {
            Ok(message) => message,
            Err(error) => return Err(self.guest_failure(error)),
        };
        loop {
            let request: Request = match serde_json::from_slice(&message) {
                Ok(request) => request,
                Err(err) => return Err(self.protocol_failure(err)),
            };
            trace!(?request, "guest request");
            let reply = match request {
                Request::Done { value, error, stderr } => {
                    let error =
                        error.or_else(|| stderr.as_deref().and_then(ExecError::from_traceback));
                    return match error {
                        Some(error) => Err(error),
                        None => Ok(value.map(from_wire).filter(|v| !matches!(v, Value::None))),
                    };
                }
                Request::Load { name } => {
                    match env.load(&name).or_else(|| self.globals.get(&name).cloned()) {
                        Some(value) => self.reply_with(Ok(value)),
                        None => Reply::Missing,
                    }
                }
                Request::Store { name, value } => match env.store(&name, from_wire(value)) {
                    Ok(()) => Reply::Stored,
                    Err(error) => Reply::Error { error },
                },
                Request::Delete { name } => match env.delete(&name) {
                    Ok(existed) => Reply::Deleted { existed },
                    Err(error) => Reply::Error { error },
                },
                Request::Call { function, args } => {
                    let args = args.into_iter().map(from_wire).collect();
                    let result = env.call_host(self, &function, args);
                    self.reply_with(result)
                }
            };
            let bytes = match serde_json::to_vec(&reply) {
                Ok(bytes) => bytes,
                Err(err) => return Err(self.protocol_failure(err)),
            };
            message = match self.call_with(&resume, &bytes) {
                Ok(message) => message,
                Err(error) => return Err(self.guest_failure(error)),
            };
        }
    }
}

impl Interpreter for WasmInterpreter {
    fn name(&self) -> &str {
        "wasm"
    }

    fn evaluate(&mut self, source: &str, env: &mut dyn Environment) -> Evaluation {
        self.store.data_mut().output.begin();
        let result = self.drive(source, env);
        let output = self.store.data_mut().output.finish();
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
    }

    fn set_step_budget(&mut self, steps: Option<u64>) {
        self.metered = steps.is_some();
        if let Err(err) = self.store.set_fuel(steps.unwrap_or(UNMETERED)) {
            warn!(error = %err, "failed to set guest fuel");
        }
    }

    fn step_budget(&self) -> Option<u64> {
        if self.metered {
            self.store.get_fuel().ok()
        } else {
            None
        }
    }

    fn save_raw_state(&self) -> Result<Vec<u8>> {
        let globals = self
            .globals
            .iter()
            .filter_map(|(name, value)| to_wire(value).ok().map(|wire| (name.clone(), wire)))
            .collect();
        let header = serde_json::to_vec(&RawHeader { globals })?;
        let memory = self.exports.memory.data(&self.store);
        let mut raw = Vec::with_capacity(8 + header.len() + memory.len());
        raw.extend_from_slice(&(header.len() as u64).to_le_bytes());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(memory);
        Ok(raw)
    }

    fn load_raw_state(&mut self, raw: &[u8]) -> Result<()> {
        let (len, rest) = raw
            .split_first_chunk::<8>()
            .ok_or_else(|| SandboxError::RawState("truncated raw state".to_string()))?;
        let len = usize::try_from(u64::from_le_bytes(*len))
            .ok()
            .filter(|&len| len <= rest.len())
            .ok_or_else(|| SandboxError::RawState("raw state header out of bounds".to_string()))?;
        let (header, saved) = rest.split_at(len);
        let header: RawHeader = serde_json::from_slice(header)?;

        let current = self.exports.memory.data_size(&self.store);
        if saved.len() > current {
            let pages = ((saved.len() - current) as u64).div_ceil(WASM_PAGE);
            self.exports
                .memory
                .grow(&mut self.store, pages)
                .map_err(|e| SandboxError::RawState(format!("cannot grow guest memory: {e}")))?;
        }
        let data = self.exports.memory.data_mut(&mut self.store);
        data[..saved.len()].copy_from_slice(saved);
        data[saved.len()..].fill(0);

        self.globals = header
            .globals
            .into_iter()
            .map(|(name, wire)| (name, from_wire(wire)))
            .collect();
        debug!(memory = saved.len(), "guest memory restored");
        Ok(())
    }

    fn import_value(&mut self, value: Value) -> Result<Value> {
        let Some(import) = self.exports.import.clone() else {
            return Ok(value);
        };
        if !matches!(value, Value::List(_) | Value::Dict(_)) {
            return Ok(value);
        }
        let wire = to_wire(&value).map_err(|e| SandboxError::Guest(e.to_string()))?;
        let bytes = serde_json::to_vec(&wire)?;
        let handle = self
            .host_call(|this| {
                let (ptr, len) = this.write_guest(&bytes)?;
                let handle = import.call(&mut this.store, (ptr, len))?;
                this.release(ptr, len);
                Ok(handle)
            })
            .map_err(|e| SandboxError::Guest(format!("sandbox_import failed: {e}")))?;
        Ok(handle_value(handle))
    }

    fn export_opaque(&mut self, value: &Opaque) -> Option<std::result::Result<Transfer, TransferError>> {
        let handle = value.downcast_ref::<GuestHandle>()?.0;
        let export = self.exports.export.clone()?;
        let wire = self
            .host_call(|this| {
                let packed = export.call(&mut this.store, handle)?;
                this.take_guest(packed)
            })
            .and_then(|bytes| Ok(serde_json::from_slice::<Wire>(&bytes)?));
        Some(match wire {
            Ok(wire) => wire_to_transfer(wire, &mut String::from("$")),
            Err(err) => {
                warn!(error = %err, handle, "sandbox_export failed");
                Err(TransferError::UnsupportedType {
                    type_name: "guest object".to_string(),
                    path: "$".to_string(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_unpack() {
        assert_eq!(unpack((1024 << 32) | 17), (1024, 17));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&Wire::List(vec![Wire::Int(1), Wire::None])).unwrap();
        assert_eq!(json, r#"{"t":"list","v":[{"t":"int","v":1},{"t":"none"}]}"#);
        let reply = serde_json::to_string(&Reply::Deleted { existed: true }).unwrap();
        assert_eq!(reply, r#"{"reply":"deleted","existed":true}"#);
    }

    #[test]
    fn test_done_request_parses() {
        let request: Request =
            serde_json::from_str(r#"{"op":"done","value":{"t":"str","v":"ok"},"error":null}"#).unwrap();
        assert!(matches!(
            request,
            Request::Done { value: Some(Wire::Str(_)), error: None, stderr: None }
        ));
    }

    #[test]
    fn test_guest_handles_round_trip_through_wire() {
        let value = from_wire(Wire::Handle(7));
        assert_eq!(to_wire(&value).unwrap(), Wire::Handle(7));
        let err = wire_to_transfer(Wire::List(vec![Wire::Handle(7)]), &mut String::from("$")).unwrap_err();
        assert_eq!(
            err,
            TransferError::UnsupportedType {
                type_name: "guest object".into(),
                path: "$[0]".into()
            }
        );
    }

    #[test]
    fn test_missing_exports_are_reported() {
        let engine = SharedEngine::new().unwrap();
        let result = WasmInterpreter::from_bytes(
            &SandboxConfig::default(),
            &engine,
            r#"(module (memory (export "memory") 1))"#,
        );
        assert!(matches!(result, Err(SandboxError::ModuleLoad(_))));
    }
}
