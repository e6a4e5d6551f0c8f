//! The wasm interpreter's request/reply protocol, driven by scripted guests.
//!
//! Each guest here ignores its input and replays a fixed list of requests:
//! `sandbox_eval` yields the first one and every `sandbox_resume` the next.

use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use pybox::prelude::*;
use pybox::{ErrorKind, SharedEngine, WasmInterpreter};
use tracing_subscriber::EnvFilter;

const TABLE_BASE: usize = 0;
const OUTPUT_BASE: usize = 512;
const MESSAGE_BASE: usize = 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn escape(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "\\{b:02x}");
        out
    })
}

/// A guest that prints `output` on every eval and then replays `messages`.
fn scripted_guest(output: &str, messages: &[&str]) -> String {
    let mut table = Vec::new();
    let mut offset = MESSAGE_BASE;
    for message in messages {
        table.extend_from_slice(&(offset as u32).to_le_bytes());
        table.extend_from_slice(&(message.len() as u32).to_le_bytes());
        offset += message.len();
    }
    let body: Vec<u8> = messages.iter().flat_map(|m| m.bytes()).collect();
    let print = if output.is_empty() {
        String::new()
    } else {
        format!("(call $output (i32.const {OUTPUT_BASE}) (i32.const {}))", output.len())
    };
    format!(
        r#"(module
  (import "sandbox" "output" (func $output (param i32 i32)))
  (memory (export "memory") 2)
  (global $step (mut i32) (i32.const 0))
  (data (i32.const {TABLE_BASE}) "{table}")
  (data (i32.const {OUTPUT_BASE}) "{out}")
  (data (i32.const {MESSAGE_BASE}) "{body}")
  (func (export "sandbox_alloc") (param i32) (result i32)
    (i32.const 65536))
  (func $message (param $i i32) (result i64)
    (i64.or
      (i64.shl
        (i64.extend_i32_u (i32.load (i32.mul (local.get $i) (i32.const 8))))
        (i64.const 32))
      (i64.extend_i32_u (i32.load offset=4 (i32.mul (local.get $i) (i32.const 8))))))
  (func (export "sandbox_eval") (param i32 i32) (result i64)
    {print}
    (global.set $step (i32.const 0))
    (call $message (i32.const 0)))
  (func (export "sandbox_resume") (param i32 i32) (result i64)
    (global.set $step (i32.add (global.get $step) (i32.const 1)))
    (call $message (global.get $step))))"#,
        table = escape(&table),
        out = escape(output.as_bytes()),
        body = escape(&body),
    )
}

const ALLOC_AT: &str = "(func (export \"sandbox_alloc\") (param i32) (result i32)\n    (i32.const 65536))";

/// Make the scripted guest's allocator trap once more than two buffers are
/// outstanding. With `free` it also exports `sandbox_free`.
fn tracking_allocator(wat: &str, free: bool) -> String {
    let mut alloc = String::from(
        r#"(global $live (mut i32) (i32.const 0))
  (func (export "sandbox_alloc") (param i32) (result i32)
    (if (i32.ge_s (global.get $live) (i32.const 2)) (then unreachable))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (i32.const 65536))"#,
    );
    if free {
        alloc.push_str(
            r#"
  (func (export "sandbox_free") (param $ptr i32) (param $len i32)
    (if (i32.eq (local.get $ptr) (i32.const 65536))
      (then (global.set $live (i32.sub (global.get $live) (i32.const 1))))))"#,
        );
    }
    assert!(wat.contains(ALLOC_AT));
    wat.replace(ALLOC_AT, &alloc)
}

/// Make the scripted guest start at the message after the first once
/// `sandbox_cancel` has been called.
fn cancellable(wat: &str) -> String {
    let start = "(global.set $step (i32.const 0))\n    (call $message (i32.const 0))";
    assert!(wat.contains(start));
    let wat = wat.replace(
        start,
        "(global.set $step (global.get $cancelled))\n    (call $message (global.get $step))",
    );
    wat.replacen(
        "(global $step",
        r#"(global $cancelled (mut i32) (i32.const 0))
  (func (export "sandbox_cancel")
    (global.set $cancelled (i32.const 1)))
  (global $step"#,
        1,
    )
}

/// A guest whose eval runs `body` instead of answering.
fn looping_guest(body: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (func (export "sandbox_alloc") (param i32) (result i32)
    (i32.const 1024))
  (func (export "sandbox_eval") (param i32 i32) (result i64)
    {body}
    (i64.const 0))
  (func (export "sandbox_resume") (param i32 i32) (result i64)
    (i64.const 0)))"#
    )
}

fn wasm_registry(config: SandboxConfig, wat: &str) -> Registry {
    init_tracing();
    let engine = SharedEngine::new().unwrap();
    let interpreter = WasmInterpreter::from_bytes(&config, &engine, wat).unwrap();
    let mut reg = Registry::with_interpreter(config, Box::new(interpreter));
    reg.init_local("main", None).unwrap();
    reg
}

#[test]
fn test_done_value_becomes_the_result() {
    let wat = scripted_guest("", &[r#"{"op":"done","value":{"t":"int","v":42}}"#]);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let result = reg.exec("main", "6 * 7").unwrap();
    assert!(result.is_success());
    assert_eq!(result.value, Some(Transfer::Int(42)));
    assert_eq!(result.display.as_deref(), Some("42"));
    assert_eq!(result.fuel_consumed, None);
}

#[test]
fn test_guest_store_lands_in_the_context() {
    let wat = scripted_guest(
        "",
        &[
            r#"{"op":"store","name":"greeting","value":{"t":"str","v":"hi"}}"#,
            r#"{"op":"done"}"#,
        ],
    );
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    reg.init_local("other", None).unwrap();
    let result = reg.exec("main", "greeting = 'hi'").unwrap();
    assert!(result.is_success());
    assert_eq!(result.value, None);
    assert_eq!(reg.fetch("main", "greeting").unwrap(), Some(Transfer::from("hi")));
    assert_eq!(reg.fetch("other", "greeting").unwrap(), None);
}

#[test]
fn test_guest_store_to_protected_name_is_refused() {
    let wat = scripted_guest(
        "",
        &[
            r#"{"op":"store","name":"api","value":{"t":"int","v":0}}"#,
            r#"{"op":"done","error":{"kind":"protection_violation","exception_type":"ProtectionViolation","message":"Cannot modify protected name 'api'"}}"#,
        ],
    );
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    reg.assign("main", "api", "trusted").unwrap();
    reg.protect("main", "api").unwrap();

    let result = reg.exec("main", "api = 0").unwrap();
    assert!(result.is_protection_violation());
    assert_eq!(reg.fetch("main", "api").unwrap(), Some(Transfer::from("trusted")));
}

#[test]
fn test_guest_call_reaches_the_tool() {
    let wat = scripted_guest(
        "",
        &[
            r#"{"op":"call","function":"__pybox_dispatch__","args":[{"t":"str","v":"greet"},{"t":"list","v":[{"t":"str","v":"wasm"}]},{"t":"dict","v":{"loud":{"t":"bool","v":true}}}]}"#,
            r#"{"op":"done","value":{"t":"str","v":"Hello wasm"}}"#,
        ],
    );
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    reg.register_tool("greet", move |session, call| {
        assert_eq!(session.caller(), "main");
        seen.borrow_mut().push(call);
        Ok(Transfer::from("Hello wasm"))
    })
    .unwrap();

    let result = reg.exec("main", "greet('wasm', loud=True)").unwrap();
    assert!(result.is_success());
    assert_eq!(result.value, Some(Transfer::from("Hello wasm")));

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec![Transfer::from("wasm")]);
    assert_eq!(calls[0].kwarg("loud"), Some(&Transfer::Bool(true)));
}

#[test]
fn test_guest_output_is_captured() {
    let wat = scripted_guest("hello from guest\n", &[r#"{"op":"done"}"#]);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let result = reg.exec("main", "print('hello from guest')").unwrap();
    assert_eq!(result.output, "hello from guest\n");
}

#[test]
fn test_guest_output_truncation() {
    let config = SandboxConfig::builder().max_output_bytes(5).build();
    let wat = scripted_guest("0123456789", &[r#"{"op":"done"}"#]);
    let mut reg = wasm_registry(config, &wat);
    let result = reg.exec("main", "print('0123456789')").unwrap();
    assert_eq!(result.output, "01234\n[output truncated]");
}

#[test]
fn test_guest_loop_runs_out_of_fuel() {
    let wat = looping_guest("(loop $spin (br $spin))");
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let result = reg.exec_with_fuel("main", "while True: pass", 10_000).unwrap();
    assert!(result.is_fuel_exhausted());
    assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::FuelExhausted));

    let result = reg.exec_with_fuel("main", "while True: pass", 10_000).unwrap();
    assert!(result.is_fuel_exhausted());
}

#[test]
fn test_guest_trap_is_a_host_error() {
    let wat = looping_guest("unreachable");
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let error = reg.exec("main", "1").unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::Host);
    assert_eq!(error.exception_type, "GuestTrap");
}

#[test]
fn test_guest_stderr_is_parsed_into_an_error() {
    let wat = scripted_guest(
        "",
        &[r#"{"op":"done","stderr":"Traceback (most recent call last):\n  File \"<stdin>\", line 1, in <module>\nKeyError: 'k'"}"#],
    );
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let error = reg.exec("main", "{}['k']").unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert_eq!(error.exception_type, "KeyError");
    assert_eq!(error.message, "'k'");
    assert!(error.traceback.is_some_and(|tb| tb.contains("line 1")));
}

#[test]
fn test_malformed_request_is_a_protocol_error() {
    let wat = scripted_guest("", &["not json"]);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let error = reg.exec("main", "1").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "GuestProtocolError");
}

#[test]
fn test_module_without_resume_is_rejected() {
    let engine = SharedEngine::new().unwrap();
    let wat = r#"(module
  (memory (export "memory") 1)
  (func (export "sandbox_alloc") (param i32) (result i32) (i32.const 0))
  (func (export "sandbox_eval") (param i32 i32) (result i64) (i64.const 0)))"#;
    let result = WasmInterpreter::from_bytes(&SandboxConfig::default(), &engine, wat);
    assert!(matches!(result, Err(SandboxError::ModuleLoad(_))));
}

#[test]
fn test_checkpoint_captures_guest_memory() {
    let wat = scripted_guest("", &[r#"{"op":"done","value":{"t":"int","v":1}}"#]);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    reg.assign("main", "kept", 5i64).unwrap();
    let checkpoint = reg.checkpoint().unwrap();
    assert!(checkpoint.raw_len() > 2 * 65536);

    reg.assign("main", "kept", 6i64).unwrap();
    reg.rollback(&checkpoint).unwrap();
    assert_eq!(reg.fetch("main", "kept").unwrap(), Some(Transfer::Int(5)));
    assert_eq!(reg.exec("main", "1").unwrap().value, Some(Transfer::Int(1)));
}

#[test]
fn test_buffers_are_released_when_the_guest_exports_free() {
    let done = [r#"{"op":"done","value":{"t":"int","v":1}}"#];
    let wat = tracking_allocator(&scripted_guest("", &done), true);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    for _ in 0..10 {
        assert!(reg.exec("main", "1").unwrap().is_success());
    }

    let wat = tracking_allocator(&scripted_guest("", &done), false);
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    assert!(reg.exec("main", "1").unwrap().is_success());
    assert!(reg.exec("main", "1").unwrap().is_success());
    let error = reg.exec("main", "1").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "GuestTrap");
}

#[test]
fn test_malformed_request_cancels_the_guest_evaluation() {
    let wat = cancellable(&scripted_guest(
        "",
        &["not json", r#"{"op":"done","value":{"t":"int","v":7}}"#],
    ));
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    let error = reg.exec("main", "1").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "GuestProtocolError");
    assert_eq!(reg.exec("main", "7").unwrap().value, Some(Transfer::Int(7)));
}

#[test]
fn test_failed_rollback_leaves_the_registry_untouched() {
    let wat = scripted_guest(
        "",
        &[
            r#"{"op":"store","name":"rows","value":{"t":"list","v":[{"t":"int","v":1},{"t":"int","v":2}]}}"#,
            r#"{"op":"done"}"#,
        ],
    )
    .replacen(
        "(func $message",
        "(func (export \"sandbox_import\") (param i32 i32) (result i32)\n    unreachable)\n  (func $message",
        1,
    );
    let mut reg = wasm_registry(SandboxConfig::default(), &wat);
    assert!(reg.exec("main", "rows = [1, 2]").unwrap().is_success());
    let checkpoint = reg.checkpoint().unwrap();

    reg.init_local("later", None).unwrap();
    reg.assign("main", "n", 5i64).unwrap();
    assert!(reg.rollback(&checkpoint).is_err());

    assert!(reg.context("later").is_some());
    assert_eq!(reg.fetch("main", "n").unwrap(), Some(Transfer::Int(5)));
    assert_eq!(
        reg.fetch("main", "rows").unwrap(),
        Some(Transfer::from(vec![1i64, 2]))
    );
}

fn prestat_guest() -> String {
    let mounted = r#"{"op":"done","value":{"t":"bool","v":true}}"#;
    let missing = r#"{"op":"done","value":{"t":"bool","v":false}}"#;
    format!(
        r#"(module
  (import "wasi_snapshot_preview1" "fd_prestat_get" (func $prestat (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{mounted_data}")
  (data (i32.const 256) "{missing_data}")
  (func (export "sandbox_alloc") (param i32) (result i32)
    (i32.const 1024))
  (func (export "sandbox_eval") (param i32 i32) (result i64)
    (if (result i64) (i32.eqz (call $prestat (i32.const 3) (i32.const 512)))
      (then (i64.const {mounted_len}))
      (else (i64.or (i64.shl (i64.const 256) (i64.const 32)) (i64.const {missing_len})))))
  (func (export "sandbox_resume") (param i32 i32) (result i64)
    (i64.const 0)))"#,
        mounted_data = escape(mounted.as_bytes()),
        missing_data = escape(missing.as_bytes()),
        mounted_len = mounted.len(),
        missing_len = missing.len(),
    )
}

#[test]
fn test_guest_sees_no_directories_by_default() {
    let mut reg = wasm_registry(SandboxConfig::default(), &prestat_guest());
    assert_eq!(reg.exec("main", "1").unwrap().value, Some(Transfer::Bool(false)));
}

#[test]
fn test_preopened_directory_is_visible_to_the_guest() {
    let config = SandboxConfig::builder()
        .preopen_dir_read_only(std::env::temp_dir(), "/data")
        .build();
    let mut reg = wasm_registry(config, &prestat_guest());
    assert_eq!(reg.exec("main", "1").unwrap().value, Some(Transfer::Bool(true)));
}

#[test]
fn test_missing_preopen_directory_is_rejected() {
    let config = SandboxConfig::builder()
        .preopen_dir("/pybox/no/such/directory", "/data")
        .build();
    let engine = SharedEngine::new().unwrap();
    let result = WasmInterpreter::from_bytes(&config, &engine, prestat_guest());
    assert!(matches!(result, Err(SandboxError::RuntimeInit(_))));
}
